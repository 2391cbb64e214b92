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

//! Pixel translation between the server's framebuffer format and each
//! client's requested format.
//!
//! A translation strategy is chosen once per `(server, client)` format
//! pair and reused for every rectangle until either side changes:
//!
//! - identical layouts copy rows untouched;
//! - colour-mapped clients are switched to a synthetic BGR233 palette
//!   (only 8bpp clients are accepted) unless they share the server's own
//!   colour map;
//! - 8 and 16 bit servers get a single lookup table over every possible
//!   pixel value;
//! - 32 bit servers get three component tables combined with OR.
//!
//! Lookup entries hold client pixel *values*; serialisation to client
//! byte order happens when a rectangle is written out.

use crate::error::{Result, VncError};
use crate::protocol::{ColourMap, PixelFormat};
use bytes::BytesMut;
use log::debug;

enum Kind {
    /// Formats are bit-identical; rows are copied.
    Copy,
    /// One table indexed by the full server pixel value.
    Single(Vec<u32>),
    /// Separate tables per colour component, indexed by the raw
    /// (unscaled) component value from the server pixel.
    Split {
        red: Vec<u32>,
        green: Vec<u32>,
        blue: Vec<u32>,
    },
}

/// Converts rectangles of server-format pixels into a client's format.
pub struct Translator {
    server_format: PixelFormat,
    client_format: PixelFormat,
    kind: Kind,
    palette: Option<ColourMap>,
}

impl Translator {
    /// Builds a translator for the given pair of formats.
    ///
    /// `colour_map` is the server's palette, required when the server
    /// format is colour-mapped.
    ///
    /// # Errors
    ///
    /// Fails when the requested format is invalid, when a colour-mapped
    /// client is not 8bpp, or when the server format is unsupported.
    pub fn new(
        server: &PixelFormat,
        requested: &PixelFormat,
        colour_map: Option<&ColourMap>,
    ) -> Result<Translator> {
        if server.bits_per_pixel != 8 && server.bits_per_pixel != 16 && server.bits_per_pixel != 32
        {
            return Err(VncError::InvalidPixelFormat);
        }
        if !requested.is_valid() {
            return Err(VncError::InvalidPixelFormat);
        }

        let mut client = requested.clone();
        let mut palette = None;

        if client.true_colour_flag == 0 {
            // Colour-mapped client. If it matches a colour-mapped server
            // exactly the palette is simply forwarded; otherwise install
            // BGR233 and treat it as true colour from here on.
            if server.true_colour_flag == 0 && server.equals(&client) {
                let map = colour_map.cloned().unwrap_or_default();
                return Ok(Translator {
                    server_format: server.clone(),
                    client_format: client,
                    kind: Kind::Copy,
                    palette: Some(map),
                });
            }
            debug!("colour-mapped client switched to BGR233 palette");
            client = PixelFormat::bgr233();
            palette = Some(ColourMap::bgr233());
        }

        let kind = if server.true_colour_flag != 0 && server.equals(&client) {
            Kind::Copy
        } else if server.true_colour_flag == 0 {
            let map = colour_map.ok_or(VncError::InvalidPixelFormat)?;
            Kind::Single(colour_map_table(map, &client))
        } else if server.bits_per_pixel <= 16 {
            Kind::Single(single_table(server, &client))
        } else {
            Kind::Split {
                red: component_table(server.red_max, client.red_max, client.red_shift),
                green: component_table(server.green_max, client.green_max, client.green_shift),
                blue: component_table(server.blue_max, client.blue_max, client.blue_shift),
            }
        };

        Ok(Translator {
            server_format: server.clone(),
            client_format: client,
            kind,
            palette,
        })
    }

    /// The effective client format (BGR233 after a palette install).
    #[must_use]
    pub fn client_format(&self) -> &PixelFormat {
        &self.client_format
    }

    /// The palette that must be delivered to the client, if any.
    #[must_use]
    pub fn pending_palette(&self) -> Option<&ColourMap> {
        self.palette.as_ref()
    }

    /// Translates one server pixel value to a client pixel value.
    #[must_use]
    pub fn translate_pixel(&self, pixel: u32) -> u32 {
        match &self.kind {
            Kind::Copy => pixel,
            Kind::Single(table) => table[pixel as usize & (table.len() - 1)],
            Kind::Split { red, green, blue } => {
                let f = &self.server_format;
                red[((pixel >> f.red_shift) & u32::from(f.red_max)) as usize]
                    | green[((pixel >> f.green_shift) & u32::from(f.green_max)) as usize]
                    | blue[((pixel >> f.blue_shift) & u32::from(f.blue_max)) as usize]
            }
        }
    }

    /// Translates a rectangle into client pixel values.
    ///
    /// `src` holds server-format rows at `stride` bytes apart; `w` and
    /// `h` are in pixels.
    #[must_use]
    pub fn pixel_words(&self, src: &[u8], stride: usize, w: usize, h: usize) -> Vec<u32> {
        let spp = self.server_format.bytes_per_pixel();
        let mut out = Vec::with_capacity(w * h);
        for y in 0..h {
            let row = &src[y * stride..y * stride + w * spp];
            for x in 0..w {
                let pixel = self.server_format.read_pixel(&row[x * spp..]);
                out.push(self.translate_pixel(pixel));
            }
        }
        out
    }

    /// Translates a rectangle into client-format bytes, packed rows.
    pub fn translate_rect(&self, src: &[u8], stride: usize, w: usize, h: usize, out: &mut BytesMut) {
        if let Kind::Copy = self.kind {
            let spp = self.server_format.bytes_per_pixel();
            out.reserve(w * h * spp);
            for y in 0..h {
                out.extend_from_slice(&src[y * stride..y * stride + w * spp]);
            }
            return;
        }
        let cpp = self.client_format.bytes_per_pixel();
        out.reserve(w * h * cpp);
        for word in self.pixel_words(src, stride, w, h) {
            self.client_format.write_pixel(out, word);
        }
    }
}

/// Scales a component from one max to another, rounding to nearest.
fn rescale(value: u32, from_max: u16, to_max: u16) -> u32 {
    if from_max == 0 {
        return 0;
    }
    (value * u32::from(to_max) + u32::from(from_max) / 2) / u32::from(from_max)
}

/// Full-pixel table for 8/16 bit true-colour servers.
fn single_table(server: &PixelFormat, client: &PixelFormat) -> Vec<u32> {
    let size = 1usize << server.bits_per_pixel;
    let mut table = Vec::with_capacity(size);
    for pixel in 0..size as u32 {
        let r = rescale(
            (pixel >> server.red_shift) & u32::from(server.red_max),
            server.red_max,
            client.red_max,
        );
        let g = rescale(
            (pixel >> server.green_shift) & u32::from(server.green_max),
            server.green_max,
            client.green_max,
        );
        let b = rescale(
            (pixel >> server.blue_shift) & u32::from(server.blue_max),
            server.blue_max,
            client.blue_max,
        );
        table.push((r << client.red_shift) | (g << client.green_shift) | (b << client.blue_shift));
    }
    table
}

/// Index table for colour-mapped servers: palette entry to client pixel.
fn colour_map_table(map: &ColourMap, client: &PixelFormat) -> Vec<u32> {
    let mut table = vec![0u32; 256];
    for (i, &(r, g, b)) in map.entries.iter().take(256).enumerate() {
        table[i] = client.rgb_to_pixel((r >> 8) as u8, (g >> 8) as u8, (b >> 8) as u8);
    }
    table
}

/// Component table for 32 bit servers: raw server component value to the
/// shifted client contribution.
fn component_table(server_max: u16, client_max: u16, client_shift: u8) -> Vec<u32> {
    let mut table = Vec::with_capacity(usize::from(server_max) + 1);
    for v in 0..=u32::from(server_max) {
        table.push(rescale(v, server_max, client_max) << client_shift);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_copies_rows() {
        let fmt = PixelFormat::rgb32();
        let t = Translator::new(&fmt, &fmt, None).unwrap();
        // Two rows of one pixel with stride padding.
        let src = [0x56, 0x34, 0x12, 0x00, 0xAA, 0xCC, 0xBB, 0xAA, 0x00, 0xAA];
        let mut out = BytesMut::new();
        t.translate_rect(&src, 5, 1, 2, &mut out);
        assert_eq!(&out[..], &[0x56, 0x34, 0x12, 0x00, 0xCC, 0xBB, 0xAA, 0x00]);
    }

    #[test]
    fn rgb32_to_rgb565_uses_split_tables() {
        let server = PixelFormat::rgb32();
        let client = PixelFormat::rgb565();
        let t = Translator::new(&server, &client, None).unwrap();

        // Pure red pixel: 0x00FF0000 little-endian.
        let src = 0x00FF_0000u32.to_le_bytes();
        let words = t.pixel_words(&src, 4, 1, 1);
        assert_eq!(words, vec![0xF800]);

        let mut out = BytesMut::new();
        t.translate_rect(&src, 4, 1, 1, &mut out);
        assert_eq!(&out[..], &0xF800u16.to_le_bytes());
    }

    #[test]
    fn rgb565_server_uses_single_table() {
        let server = PixelFormat::rgb565();
        let client = PixelFormat::rgb32();
        let t = Translator::new(&server, &client, None).unwrap();

        // Pure green in RGB565 is 0x07E0.
        let src = 0x07E0u16.to_le_bytes();
        let words = t.pixel_words(&src, 2, 1, 1);
        assert_eq!(words, vec![0x0000_FF00]);
    }

    #[test]
    fn colour_mapped_client_gets_bgr233() {
        let server = PixelFormat::rgb32();
        let requested = PixelFormat::colour_map8();
        let t = Translator::new(&server, &requested, None).unwrap();
        assert!(t.client_format().equals(&PixelFormat::bgr233()));
        let palette = t.pending_palette().unwrap();
        assert_eq!(palette.entries.len(), 256);

        // White maps to the all-ones BGR233 index.
        let src = 0x00FF_FFFFu32.to_le_bytes();
        assert_eq!(t.pixel_words(&src, 4, 1, 1), vec![0xFF]);
    }

    #[test]
    fn colour_mapped_server_translates_through_palette() {
        let server = PixelFormat::colour_map8();
        let client = PixelFormat::rgb32();
        let map = ColourMap {
            entries: vec![(0, 0, 0), (0xFFFF, 0, 0), (0, 0xFFFF, 0)],
        };
        let t = Translator::new(&server, &client, Some(&map)).unwrap();
        let src = [1u8, 2u8];
        assert_eq!(t.pixel_words(&src, 2, 2, 1), vec![0x00FF_0000, 0x0000_FF00]);
    }

    #[test]
    fn colour_mapped_sixteen_bit_client_is_rejected() {
        let server = PixelFormat::rgb32();
        let mut requested = PixelFormat::colour_map8();
        requested.bits_per_pixel = 16;
        requested.depth = 16;
        assert!(Translator::new(&server, &requested, None).is_err());
    }
}
