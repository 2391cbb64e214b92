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

//! CoRRE (compact RRE) encoding.
//!
//! Same algorithm as RRE with 8-bit subrectangle geometry. A CoRRE
//! payload therefore only covers tiles up to 255x255; the update
//! scheduler slices rectangles into `corre_max_width` x
//! `corre_max_height` tiles (48x48 by default) and emits one rectangle
//! per tile, which also keeps the rectangle count exact.

use super::common::{find_subrects, get_background_color};
use super::Encoding;
use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};

/// The "CoRRE" encoding for one tile of at most 255x255 pixels.
///
/// Payload: `[n_subrects u32][bg pixel]` then per subrect
/// `[pixel][x u8][y u8][w u8][h u8]`.
pub struct CorRreEncoding;

impl Encoding for CorRreEncoding {
    fn encode(&self, pixels: &[u32], format: &PixelFormat, width: u16, height: u16) -> BytesMut {
        debug_assert!(width <= 255 && height <= 255);

        let bg_color = get_background_color(pixels);
        let subrects = find_subrects(pixels, width as usize, height as usize, bg_color);

        let bpp = format.bytes_per_pixel();
        let mut buf = BytesMut::with_capacity(4 + bpp + subrects.len() * (bpp + 4));

        buf.put_u32(subrects.len() as u32);
        format.write_pixel(&mut buf, bg_color);

        for subrect in subrects {
            format.write_pixel(&mut buf, subrect.color);
            buf.put_u8(subrect.x as u8);
            buf.put_u8(subrect.y as u8);
            buf.put_u8(subrect.w as u8);
            buf.put_u8(subrect.h as u8);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_subrect_layout() {
        let pixels = [7, 7, 9, 7];
        let buf = CorRreEncoding.encode(&pixels, &PixelFormat::rgb32(), 4, 1);
        assert_eq!(&buf[0..4], &1u32.to_be_bytes());
        assert_eq!(&buf[4..8], &[7, 0, 0, 0]);
        assert_eq!(&buf[8..12], &[9, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[2, 0, 1, 1]);
    }
}
