// Copyright 2025 The rfbserver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-client transmission statistics.
//!
//! Counts rectangles and bytes per encoding plus the raw-bytes equivalent
//! of everything sent, so the compression win is visible in the logs when
//! a client disconnects.

use crate::protocol::*;
use log::info;
use std::collections::HashMap;

/// Human-readable name for an encoding identifier.
#[must_use]
pub fn encoding_name(encoding: i32) -> &'static str {
    match encoding {
        ENCODING_RAW => "raw",
        ENCODING_COPYRECT => "copyrect",
        ENCODING_RRE => "rre",
        ENCODING_CORRE => "corre",
        ENCODING_HEXTILE => "hextile",
        ENCODING_ZLIB => "zlib",
        ENCODING_TIGHT => "tight",
        ENCODING_ZRLE => "zrle",
        ENCODING_XCURSOR => "xcursor",
        ENCODING_RICH_CURSOR => "richcursor",
        ENCODING_POINTER_POS => "pointerpos",
        ENCODING_LAST_RECT => "lastrect",
        _ => "unknown",
    }
}

/// Rectangle and byte counters for one encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodingStats {
    /// Rectangles sent with this encoding.
    pub rects: u64,
    /// Wire bytes sent with this encoding, headers included.
    pub bytes: u64,
}

/// Counters accumulated over a client's lifetime.
#[derive(Debug, Default)]
pub struct ClientStats {
    per_encoding: HashMap<i32, EncodingStats>,
    /// Bytes the same rectangles would have cost as Raw.
    pub raw_bytes_equivalent: u64,
    /// FramebufferUpdate messages sent.
    pub updates_sent: u64,
    /// Key events received.
    pub key_events: u64,
    /// Pointer events received.
    pub pointer_events: u64,
    /// Cut-text messages received.
    pub cut_texts: u64,
}

impl ClientStats {
    /// Records one sent rectangle.
    pub fn record_rect(&mut self, encoding: i32, bytes: usize) {
        let entry = self.per_encoding.entry(encoding).or_default();
        entry.rects += 1;
        entry.bytes += bytes as u64;
    }

    /// Adds to the raw-equivalent byte count.
    pub fn record_raw_equivalent(&mut self, bytes: usize) {
        self.raw_bytes_equivalent += bytes as u64;
    }

    /// Counters for one encoding, if any rectangles used it.
    #[must_use]
    pub fn encoding(&self, encoding: i32) -> Option<EncodingStats> {
        self.per_encoding.get(&encoding).copied()
    }

    /// Total wire bytes across all encodings.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.per_encoding.values().map(|e| e.bytes).sum()
    }

    /// Logs a summary, called when the client goes away.
    pub fn log_summary(&self, host: &str) {
        info!(
            "{}: {} updates, {} key events, {} pointer events, {} cut texts",
            host, self.updates_sent, self.key_events, self.pointer_events, self.cut_texts
        );
        let mut encodings: Vec<_> = self.per_encoding.iter().collect();
        encodings.sort_by_key(|(enc, _)| **enc);
        for (enc, stats) in encodings {
            info!(
                "{}: {} rects, {} bytes as {}",
                host,
                stats.rects,
                stats.bytes,
                encoding_name(*enc)
            );
        }
        let total = self.total_bytes();
        if total > 0 && self.raw_bytes_equivalent > 0 {
            info!(
                "{}: {} bytes sent for {} raw-equivalent ({:.1}x compression)",
                host,
                total,
                self.raw_bytes_equivalent,
                self.raw_bytes_equivalent as f64 / total as f64
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let mut stats = ClientStats::default();
        stats.record_rect(ENCODING_TIGHT, 100);
        stats.record_rect(ENCODING_TIGHT, 50);
        stats.record_rect(ENCODING_COPYRECT, 16);
        stats.record_raw_equivalent(4000);

        let tight = stats.encoding(ENCODING_TIGHT).unwrap();
        assert_eq!(tight.rects, 2);
        assert_eq!(tight.bytes, 150);
        assert_eq!(stats.total_bytes(), 166);
        assert_eq!(stats.raw_bytes_equivalent, 4000);
        assert!(stats.encoding(ENCODING_ZRLE).is_none());
    }
}
