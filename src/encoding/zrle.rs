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

//! ZRLE (Zlib Run-Length Encoding).
//!
//! The rectangle is cut into 64x64 tiles; each tile independently picks
//! the cheapest of five sub-encodings (raw, solid, packed palette, plain
//! RLE, palette RLE) and the serialised tiles are pushed through the
//! client's persistent ZRLE deflate stream. Pixels travel as CPIXELs:
//! three bytes when the client's 32bpp format leaves a byte unused,
//! full width otherwise.

use super::common::{build_palette, check_solid_color, extract_tile};
use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};
use flate2::Compress;
use std::collections::HashMap;
use std::io;

const TILE_SIZE: usize = 64;

/// Counts RLE runs, single pixels and distinct colours in one pass.
fn analyze_runs_and_palette(pixels: &[u32]) -> (usize, usize, HashMap<u32, usize>) {
    let mut runs = 0;
    let mut single_pixels = 0;
    let mut unique_colors: HashMap<u32, usize> = HashMap::new();

    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        *unique_colors.entry(color).or_insert(0) += 1;

        let mut run_len = 1;
        while i + run_len < pixels.len() && pixels[i + run_len] == color {
            run_len += 1;
        }

        if run_len == 1 {
            single_pixels += 1;
        } else {
            runs += 1;
        }
        i += run_len;
    }
    (runs, single_pixels, unique_colors)
}

/// Encodes a rectangle with ZRLE through the client's persistent stream.
///
/// Returns the 4-byte big-endian length header plus the compressed tile
/// stream.
///
/// # Errors
///
/// Propagates compression failures; the caller abandons the update.
pub fn encode_zrle_persistent(
    pixels: &[u32],
    format: &PixelFormat,
    width: u16,
    height: u16,
    compressor: &mut Compress,
) -> io::Result<Vec<u8>> {
    let width = width as usize;
    let height = height as usize;
    let mut tiles = BytesMut::new();

    for y in (0..height).step_by(TILE_SIZE) {
        for x in (0..width).step_by(TILE_SIZE) {
            let tile_w = (width - x).min(TILE_SIZE);
            let tile_h = (height - y).min(TILE_SIZE);

            let tile = extract_tile(pixels, width, x, y, tile_w, tile_h);
            encode_tile(&mut tiles, &tile, format, tile_w, tile_h);
        }
    }

    let compressed = super::zlib::compress_sync(compressor, &tiles)?;

    let mut result = BytesMut::with_capacity(4 + compressed.len());
    result.put_u32(compressed.len() as u32);
    result.extend_from_slice(&compressed);
    Ok(result.to_vec())
}

/// Encodes one tile, choosing the cheapest sub-encoding.
fn encode_tile(buf: &mut BytesMut, pixels: &[u32], format: &PixelFormat, width: usize, height: usize) {
    if let Some(color) = check_solid_color(pixels) {
        buf.put_u8(1);
        format.write_compact_pixel(buf, color);
        return;
    }

    let (runs, single_pixels, unique_colors) = analyze_runs_and_palette(pixels);
    let cpixel = format.compact_pixel_size();

    let mut use_rle = false;
    let mut use_palette = false;
    let mut estimated_bytes = width * height * cpixel; // raw

    let plain_rle_bytes = (cpixel + 1) * (runs + single_pixels);
    if plain_rle_bytes < estimated_bytes {
        use_rle = true;
        estimated_bytes = plain_rle_bytes;
    }

    if unique_colors.len() < 128 {
        let palette_size = unique_colors.len();

        // Palette RLE: runs cost two bytes, singles one.
        let palette_rle_bytes = cpixel * palette_size + 2 * runs + single_pixels;
        if palette_rle_bytes < estimated_bytes {
            use_rle = true;
            use_palette = true;
            estimated_bytes = palette_rle_bytes;
        }

        // Packed palette without RLE, 1/2/4 bits per pixel.
        if palette_size <= 16 {
            let bits_per_packed_pixel = match palette_size {
                2 => 1,
                3..=4 => 2,
                _ => 4,
            };
            let packed_bytes =
                cpixel * palette_size + height * (width * bits_per_packed_pixel + 7) / 8;
            if packed_bytes < estimated_bytes {
                use_rle = false;
                use_palette = true;
            }
        }
    }

    if !use_palette {
        if use_rle {
            buf.put_u8(128);
            encode_plain_rle(buf, pixels, format);
        } else {
            buf.put_u8(0);
            for &pixel in pixels {
                format.write_compact_pixel(buf, pixel);
            }
        }
        return;
    }

    let palette = build_palette(pixels, 127).expect("palette bounded by colour count");
    let color_to_idx: HashMap<u32, u8> = palette
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i as u8))
        .collect();

    if use_rle {
        encode_palette_rle(buf, pixels, format, &palette, &color_to_idx);
    } else {
        encode_packed_palette(buf, pixels, format, width, height, &palette, &color_to_idx);
    }
}

/// Plain RLE: CPIXEL plus a variable-length run for every run.
fn encode_plain_rle(buf: &mut BytesMut, pixels: &[u32], format: &PixelFormat) {
    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        let mut run_len = 1;
        while i + run_len < pixels.len() && pixels[i + run_len] == color {
            run_len += 1;
        }
        format.write_compact_pixel(buf, color);
        put_run_length(buf, run_len);
        i += run_len;
    }
}

/// Packed palette: CPIXEL palette then indices packed MSB-first, each
/// row byte-aligned.
fn encode_packed_palette(
    buf: &mut BytesMut,
    pixels: &[u32],
    format: &PixelFormat,
    width: usize,
    height: usize,
    palette: &[u32],
    color_to_idx: &HashMap<u32, u8>,
) {
    let bits_per_pixel = match palette.len() {
        2 => 1,
        3..=4 => 2,
        _ => 4,
    };

    buf.put_u8(palette.len() as u8);
    for &color in palette {
        format.write_compact_pixel(buf, color);
    }

    for y in 0..height {
        let mut byte = 0u8;
        let mut bits = 0;
        for x in 0..width {
            let idx = color_to_idx[&pixels[y * width + x]];
            byte = (byte << bits_per_pixel) | idx;
            bits += bits_per_pixel;
            if bits == 8 {
                buf.put_u8(byte);
                byte = 0;
                bits = 0;
            }
        }
        if bits > 0 {
            buf.put_u8(byte << (8 - bits));
        }
    }
}

/// Palette RLE: palette, then per run either a bare index or the index
/// with bit 7 set followed by the run length.
fn encode_palette_rle(
    buf: &mut BytesMut,
    pixels: &[u32],
    format: &PixelFormat,
    palette: &[u32],
    color_to_idx: &HashMap<u32, u8>,
) {
    buf.put_u8(128 | palette.len() as u8);
    for &color in palette {
        format.write_compact_pixel(buf, color);
    }

    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        let index = color_to_idx[&color];

        let mut run_len = 1;
        while i + run_len < pixels.len() && pixels[i + run_len] == color {
            run_len += 1;
        }

        if run_len == 1 {
            buf.put_u8(index);
        } else {
            buf.put_u8(index | 128);
            put_run_length(buf, run_len);
        }
        i += run_len;
    }
}

/// Run lengths are `run - 1` as a sum of bytes: 255 means "255 plus the
/// following byte".
fn put_run_length(buf: &mut BytesMut, run_len: usize) {
    let mut remaining = run_len - 1;
    while remaining >= 255 {
        buf.put_u8(255);
        remaining -= 255;
    }
    buf.put_u8(remaining as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, Decompress, FlushDecompress};

    fn decode_stream(encoded: &[u8]) -> Vec<u8> {
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);
        let mut inflater = Decompress::new(true);
        let mut out = vec![0u8; 1 << 20];
        inflater
            .decompress(&encoded[4..], &mut out, FlushDecompress::Sync)
            .unwrap();
        out.truncate(inflater.total_out() as usize);
        out
    }

    #[test]
    fn solid_tile_is_one_cpixel() {
        let mut compressor = Compress::new(Compression::new(6), true);
        let pixels = vec![0x00AB_CDEFu32; 8 * 8];
        let encoded =
            encode_zrle_persistent(&pixels, &PixelFormat::rgb32(), 8, 8, &mut compressor).unwrap();
        let tiles = decode_stream(&encoded);
        // Sub-encoding 1 plus a 3-byte CPIXEL (rgb32 leaves the top byte
        // unused).
        assert_eq!(tiles, vec![1, 0xEF, 0xCD, 0xAB]);
    }

    #[test]
    fn two_colour_tile_uses_packed_palette() {
        let mut compressor = Compress::new(Compression::new(6), true);
        // 8x1 alternating pixels defeat RLE; the packed palette wins.
        let pixels: Vec<u32> = (0..8).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();
        let encoded =
            encode_zrle_persistent(&pixels, &PixelFormat::rgb32(), 8, 1, &mut compressor).unwrap();
        let tiles = decode_stream(&encoded);
        assert_eq!(tiles[0], 2); // palette of two
        assert_eq!(&tiles[1..4], &[1, 0, 0]); // CPIXEL 1
        assert_eq!(&tiles[4..7], &[2, 0, 0]); // CPIXEL 2
        assert_eq!(tiles[7], 0b0101_0101); // indices MSB-first
        assert_eq!(tiles.len(), 8);
    }

    #[test]
    fn long_runs_use_plain_rle() {
        let mut compressor = Compress::new(Compression::new(6), true);
        // 30 distinct long runs defeat both palettes cheaply.
        let mut pixels = Vec::new();
        for color in 0..30u32 {
            pixels.extend(std::iter::repeat(color + 0x100).take(60));
        }
        let encoded =
            encode_zrle_persistent(&pixels, &PixelFormat::rgb32(), 60, 30, &mut compressor)
                .unwrap();
        let tiles = decode_stream(&encoded);
        assert_eq!(tiles[0], 128); // plain RLE
        // First run: CPIXEL 0x100 then run length 59 as one byte.
        assert_eq!(&tiles[1..4], &[0x00, 0x01, 0x00]);
        assert_eq!(tiles[4], 59);
    }

    #[test]
    fn full_width_pixels_for_16bpp_clients() {
        let mut compressor = Compress::new(Compression::new(6), true);
        let pixels = vec![0xF800u32; 4];
        let encoded =
            encode_zrle_persistent(&pixels, &PixelFormat::rgb565(), 4, 1, &mut compressor).unwrap();
        let tiles = decode_stream(&encoded);
        // Solid tile: sub-encoding byte plus a full 2-byte pixel.
        assert_eq!(tiles, vec![1, 0x00, 0xF8]);
    }
}
