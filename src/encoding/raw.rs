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

//! Raw encoding: translated pixels, row by row, no compression.

use super::Encoding;
use crate::protocol::PixelFormat;
use bytes::BytesMut;

/// The "Raw" encoding. Bandwidth-hungry but universally supported, and
/// the fallback whenever a smarter encoder would not pay off.
pub struct RawEncoding;

impl Encoding for RawEncoding {
    fn encode(&self, pixels: &[u32], format: &PixelFormat, _width: u16, _height: u16) -> BytesMut {
        let mut buf = BytesMut::with_capacity(pixels.len() * format.bytes_per_pixel());
        for &pixel in pixels {
            format.write_pixel(&mut buf, pixel);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_at_client_width() {
        let pixels = [0x00FF_0000, 0x0000_00FF];

        let buf32 = RawEncoding.encode(&pixels, &PixelFormat::rgb32(), 2, 1);
        assert_eq!(&buf32[..], &[0, 0, 0xFF, 0, 0xFF, 0, 0, 0]);

        let buf16 = RawEncoding.encode(&[0xF800, 0x001F], &PixelFormat::rgb565(), 2, 1);
        assert_eq!(&buf16[..], &[0x00, 0xF8, 0x1F, 0x00]);
    }
}
