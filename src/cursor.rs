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

//! Cursor shapes and their pseudo-rectangle wire encodings.
//!
//! A cursor is a small bitmap with a transparency mask and a hotspot.
//! Clients that negotiated cursor-shape updates receive the shape as a
//! pseudo-rectangle (XCursor or RichCursor flavour) and render it
//! locally; everyone else gets the cursor painted straight into the
//! framebuffer by the server.

use crate::protocol::{PixelFormat, Rectangle, ENCODING_RICH_CURSOR, ENCODING_XCURSOR};
use bytes::{BufMut, BytesMut};

/// A cursor shape: 1-bit source and mask bitmaps, two colours, and an
/// optional full-colour overlay for RichCursor-capable clients.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Hotspot X offset within the shape.
    pub hot_x: u16,
    /// Hotspot Y offset within the shape.
    pub hot_y: u16,
    /// Shape width in pixels.
    pub width: u16,
    /// Shape height in pixels.
    pub height: u16,
    /// Source bitmap, one bit per pixel, rows padded to whole bytes,
    /// most significant bit first. Set bits select the foreground colour.
    pub source: Vec<u8>,
    /// Transparency mask in the same layout; clear bits are transparent.
    pub mask: Vec<u8>,
    /// Foreground colour as 16-bit RGB.
    pub fg: (u16, u16, u16),
    /// Background colour as 16-bit RGB.
    pub bg: (u16, u16, u16),
    /// Optional full-colour source, `width * height` RGB byte triples.
    pub rich_rgb: Option<Vec<u8>>,
}

impl Cursor {
    /// Builds a two-colour cursor from source and mask bitmaps.
    #[must_use]
    pub fn from_bitmaps(
        width: u16,
        height: u16,
        hot_x: u16,
        hot_y: u16,
        source: Vec<u8>,
        mask: Vec<u8>,
    ) -> Self {
        Self {
            hot_x,
            hot_y,
            width,
            height,
            source,
            mask,
            fg: (0, 0, 0),
            bg: (0xFFFF, 0xFFFF, 0xFFFF),
            rich_rgb: None,
        }
    }

    /// Bytes per bitmap row.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        (usize::from(self.width) + 7) / 8
    }

    /// Reads a bit from a row-padded bitmap.
    fn bit(bits: &[u8], row_bytes: usize, x: usize, y: usize) -> bool {
        let byte = bits.get(y * row_bytes + x / 8).copied().unwrap_or(0);
        byte & (0x80 >> (x % 8)) != 0
    }

    /// Whether the pixel at `(x, y)` is opaque.
    #[must_use]
    pub fn mask_bit(&self, x: usize, y: usize) -> bool {
        Self::bit(&self.mask, self.row_bytes(), x, y)
    }

    /// Whether the pixel at `(x, y)` selects the foreground colour.
    #[must_use]
    pub fn source_bit(&self, x: usize, y: usize) -> bool {
        Self::bit(&self.source, self.row_bytes(), x, y)
    }

    /// The 8-bit RGB colour of the pixel at `(x, y)`, from the rich
    /// overlay when present, else from the two-colour bitmap.
    #[must_use]
    pub fn pixel_rgb(&self, x: usize, y: usize) -> (u8, u8, u8) {
        if let Some(rgb) = &self.rich_rgb {
            let i = (y * usize::from(self.width) + x) * 3;
            if i + 2 < rgb.len() {
                return (rgb[i], rgb[i + 1], rgb[i + 2]);
            }
        }
        let (r, g, b) = if self.source_bit(x, y) { self.fg } else { self.bg };
        ((r >> 8) as u8, (g >> 8) as u8, (b >> 8) as u8)
    }

    /// Appends a cursor-shape pseudo-rectangle to `buf`.
    ///
    /// The rectangle header carries the hotspot as position and the shape
    /// size as dimensions. RichCursor sends client-format pixels followed
    /// by the mask; XCursor sends the two colours, the source bitmap and
    /// the mask.
    pub fn write_shape_rect(&self, buf: &mut BytesMut, format: &PixelFormat, rich: bool) {
        let encoding = if rich { ENCODING_RICH_CURSOR } else { ENCODING_XCURSOR };
        Rectangle {
            x: self.hot_x,
            y: self.hot_y,
            width: self.width,
            height: self.height,
            encoding,
        }
        .write_header(buf);

        let bitmap_len = self.row_bytes() * usize::from(self.height);
        if rich {
            for y in 0..usize::from(self.height) {
                for x in 0..usize::from(self.width) {
                    let (r, g, b) = self.pixel_rgb(x, y);
                    format.write_pixel(buf, format.rgb_to_pixel(r, g, b));
                }
            }
            buf.put_slice(&self.mask[..bitmap_len]);
        } else {
            let (fr, fg_, fb) = self.fg;
            let (br, bg_, bb) = self.bg;
            buf.put_u8((fr >> 8) as u8);
            buf.put_u8((fg_ >> 8) as u8);
            buf.put_u8((fb >> 8) as u8);
            buf.put_u8((br >> 8) as u8);
            buf.put_u8((bg_ >> 8) as u8);
            buf.put_u8((bb >> 8) as u8);
            buf.put_slice(&self.source[..bitmap_len]);
            buf.put_slice(&self.mask[..bitmap_len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two() -> Cursor {
        let mut c = Cursor::from_bitmaps(2, 2, 0, 1, vec![0x80, 0x40], vec![0xC0, 0xC0]);
        c.rich_rgb = Some(vec![
            255, 0, 0, /* */ 0, 0, 0, //
            0, 0, 0, /*   */ 255, 0, 0,
        ]);
        c
    }

    #[test]
    fn bitmap_bits() {
        let c = two_by_two();
        assert!(c.source_bit(0, 0));
        assert!(!c.source_bit(1, 0));
        assert!(c.source_bit(1, 1));
        assert!(c.mask_bit(0, 0) && c.mask_bit(1, 0) && c.mask_bit(0, 1) && c.mask_bit(1, 1));
    }

    #[test]
    fn rich_cursor_rect_layout() {
        let c = two_by_two();
        let fmt = PixelFormat::rgb32();
        let mut buf = BytesMut::new();
        c.write_shape_rect(&mut buf, &fmt, true);

        // Header: hotspot, size, RichCursor id.
        assert_eq!(&buf[0..2], &0u16.to_be_bytes()); // x = hot_x
        assert_eq!(&buf[2..4], &1u16.to_be_bytes()); // y = hot_y
        assert_eq!(&buf[4..6], &2u16.to_be_bytes());
        assert_eq!(&buf[6..8], &2u16.to_be_bytes());
        assert_eq!(&buf[8..12], &(-239i32).to_be_bytes());

        // 4 pixels of 4 bytes, then 2 mask bytes (one padded byte/row).
        assert_eq!(buf.len(), 12 + 4 * 4 + 2);
        // First pixel is red: 0x00FF0000 little-endian.
        assert_eq!(&buf[12..16], &[0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(&buf[12 + 16..], &[0xC0, 0xC0]);
    }

    #[test]
    fn xcursor_rect_layout() {
        let mut c = two_by_two();
        c.rich_rgb = None;
        c.fg = (0xFFFF, 0, 0);
        let fmt = PixelFormat::rgb32();
        let mut buf = BytesMut::new();
        c.write_shape_rect(&mut buf, &fmt, false);

        assert_eq!(&buf[8..12], &(-240i32).to_be_bytes());
        // 6 colour bytes, 2 source bytes, 2 mask bytes.
        assert_eq!(buf.len(), 12 + 6 + 2 + 2);
        assert_eq!(&buf[12..18], &[0xFF, 0, 0, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&buf[18..20], &[0x80, 0x40]);
        assert_eq!(&buf[20..22], &[0xC0, 0xC0]);
    }
}
