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

//! RRE (rise-and-run-length) encoding.
//!
//! A rectangle becomes a background colour plus a list of uniformly
//! coloured subrectangles. The caller compares the result against the
//! raw size and falls back to Raw when RRE loses.

use super::common::{find_subrects, get_background_color};
use super::Encoding;
use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};

/// The "RRE" encoding.
///
/// Payload: `[n_subrects u32][bg pixel]` then per subrect
/// `[pixel][x u16][y u16][w u16][h u16]`, coordinates big-endian.
pub struct RreEncoding;

impl Encoding for RreEncoding {
    fn encode(&self, pixels: &[u32], format: &PixelFormat, width: u16, height: u16) -> BytesMut {
        let bg_color = get_background_color(pixels);
        let subrects = find_subrects(pixels, width as usize, height as usize, bg_color);

        let bpp = format.bytes_per_pixel();
        let mut buf = BytesMut::with_capacity(4 + bpp + subrects.len() * (bpp + 8));

        buf.put_u32(subrects.len() as u32);
        format.write_pixel(&mut buf, bg_color);

        for subrect in subrects {
            format.write_pixel(&mut buf, subrect.color);
            buf.put_u16(subrect.x);
            buf.put_u16(subrect.y);
            buf.put_u16(subrect.w);
            buf.put_u16(subrect.h);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_rect_is_header_only() {
        let pixels = vec![0xABCDu32; 12];
        let buf = RreEncoding.encode(&pixels, &PixelFormat::rgb32(), 4, 3);
        assert_eq!(&buf[0..4], &0u32.to_be_bytes());
        assert_eq!(buf.len(), 4 + 4);
    }

    #[test]
    fn single_subrect_layout() {
        // 4x1: background 0 with one pixel of 0xFF0000 at x=2.
        let pixels = [0, 0, 0x00FF_0000, 0];
        let buf = RreEncoding.encode(&pixels, &PixelFormat::rgb32(), 4, 1);
        assert_eq!(&buf[0..4], &1u32.to_be_bytes());
        // Background pixel (0) little-endian.
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        // Subrect: pixel, then x=2 y=0 w=1 h=1.
        assert_eq!(&buf[8..12], &[0, 0, 0xFF, 0]);
        assert_eq!(&buf[12..20], &[0, 2, 0, 0, 0, 1, 0, 1]);
    }
}
