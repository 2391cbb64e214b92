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

//! Hextile encoding: 16x16 tiles with per-tile subencodings.
//!
//! Each tile is raw, solid, monochrome-with-subrects or
//! coloured-with-subrects. Background and foreground colours carry over
//! from tile to tile when unchanged.

use super::common::{analyze_tile_colors, extract_tile, find_subrects};
use super::Encoding;
use crate::protocol::{
    PixelFormat, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED, HEXTILE_FOREGROUND_SPECIFIED,
    HEXTILE_RAW, HEXTILE_SUBRECTS_COLOURED,
};
use bytes::{BufMut, BytesMut};

/// The "Hextile" encoding.
pub struct HextileEncoding;

impl Encoding for HextileEncoding {
    fn encode(&self, pixels: &[u32], format: &PixelFormat, width: u16, height: u16) -> BytesMut {
        let mut buf = BytesMut::new();
        let bpp = format.bytes_per_pixel();

        let mut last_bg: Option<u32> = None;
        let mut last_fg: Option<u32> = None;

        for tile_y in (0..height).step_by(16) {
            for tile_x in (0..width).step_by(16) {
                let tile_w = 16.min(width - tile_x);
                let tile_h = 16.min(height - tile_y);

                let tile_pixels = extract_tile(
                    pixels,
                    width as usize,
                    tile_x as usize,
                    tile_y as usize,
                    tile_w as usize,
                    tile_h as usize,
                );

                let (is_solid, is_mono, bg, fg) = analyze_tile_colors(&tile_pixels);

                let mut subencoding: u8 = 0;
                let tile_start = buf.len();

                // Reserve space for the subencoding byte.
                buf.put_u8(0);

                if is_solid {
                    if Some(bg) != last_bg {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        format.write_pixel(&mut buf, bg);
                        last_bg = Some(bg);
                    }
                } else {
                    let subrects =
                        find_subrects(&tile_pixels, tile_w as usize, tile_h as usize, bg);

                    let raw_size = tile_w as usize * tile_h as usize * bpp;
                    let bg_overhead = if Some(bg) == last_bg { 0 } else { bpp };
                    let fg_overhead = if is_mono && Some(fg) != last_fg { bpp } else { 0 };
                    let subrect_data = subrects.len() * if is_mono { 2 } else { 2 + bpp };
                    let encoded_size = bg_overhead + fg_overhead + 1 + subrect_data;

                    if subrects.is_empty() || subrects.len() > 255 || encoded_size > raw_size {
                        // Raw tile; a raw tile invalidates carried colours.
                        buf.truncate(tile_start);
                        buf.put_u8(HEXTILE_RAW);
                        for &pixel in &tile_pixels {
                            format.write_pixel(&mut buf, pixel);
                        }
                        last_bg = None;
                        last_fg = None;
                        continue;
                    }

                    if Some(bg) != last_bg {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        format.write_pixel(&mut buf, bg);
                        last_bg = Some(bg);
                    }

                    subencoding |= HEXTILE_ANY_SUBRECTS;

                    if is_mono {
                        if Some(fg) != last_fg {
                            subencoding |= HEXTILE_FOREGROUND_SPECIFIED;
                            format.write_pixel(&mut buf, fg);
                            last_fg = Some(fg);
                        }

                        buf.put_u8(subrects.len() as u8);
                        for sr in subrects {
                            buf.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                            buf.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                        }
                    } else {
                        subencoding |= HEXTILE_SUBRECTS_COLOURED;
                        last_fg = None;

                        buf.put_u8(subrects.len() as u8);
                        for sr in subrects {
                            format.write_pixel(&mut buf, sr.color);
                            buf.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                            buf.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                        }
                    }
                }

                buf[tile_start] = subencoding;
            }
        }

        buf
    }
}
