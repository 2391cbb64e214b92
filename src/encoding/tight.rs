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

//! Tight encoding.
//!
//! Two layers, as in the reference implementations:
//!
//! - **Splitting**: large rectangles are scanned in 16x16 steps for
//!   solid-colour areas, which are grown to their maximum extent and
//!   emitted as fills; the remainder recurses. Leaf rectangles respect
//!   the protocol ceilings (width <= 2048, <= 65536 pixels), so one
//!   input rectangle may produce several wire rectangles.
//! - **Encoding**: each leaf counts its colours and picks solid fill,
//!   two-colour mono (1 bit/pixel), indexed palette (1 byte/pixel),
//!   full colour, or JPEG for photographic content when the client asked
//!   for lossy quality.
//!
//! Compressed blocks rotate through the client's four persistent zlib
//! streams; the control byte carries the stream id in bits 4-5 and the
//! explicit-filter flag at 0x40. Blocks under 12 bytes are sent raw
//! without a length. 32bpp pixels with depth 24 and 8-bit channels
//! travel packed to 3 bytes.

use super::common::{build_palette, check_solid_color};
use super::zlib::compress_sync;
use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression};
use log::debug;
use std::io;

const TIGHT_MIN_TO_COMPRESS: usize = 12;
const MIN_SPLIT_RECT_SIZE: usize = 4096;
const MIN_SOLID_SUBRECT_SIZE: usize = 2048;
const MAX_SPLIT_TILE_SIZE: u16 = 16;
const TIGHT_MAX_RECT_SIZE: usize = 65536;
const TIGHT_MAX_RECT_WIDTH: u16 = 2048;

const CONTROL_FILL: u8 = 0x80;
const CONTROL_JPEG: u8 = 0x90;
const CONTROL_EXPLICIT_FILTER: u8 = 0x40;
const FILTER_PALETTE: u8 = 0x01;

/// JPEG quality percentage for each client quality level 0-9.
pub const QUALITY_TO_JPEG: [u8; 10] = [15, 29, 41, 42, 62, 77, 79, 86, 92, 100];

/// Per-compression-level tuning, mirroring the classic Tight tables.
struct TightConf {
    mono_min_rect_size: usize,
    idx_zlib_level: u8,
    mono_zlib_level: u8,
    raw_zlib_level: u8,
    idx_max_colors_divisor: usize,
}

static TIGHT_CONF: [TightConf; 4] = [
    TightConf { mono_min_rect_size: 6, idx_zlib_level: 0, mono_zlib_level: 0, raw_zlib_level: 0, idx_max_colors_divisor: 4 },
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 1, mono_zlib_level: 1, raw_zlib_level: 1, idx_max_colors_divisor: 8 },
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 3, mono_zlib_level: 3, raw_zlib_level: 2, idx_max_colors_divisor: 24 },
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 7, mono_zlib_level: 7, raw_zlib_level: 5, idx_max_colors_divisor: 96 },
];

fn conf_for_level(level: u8) -> &'static TightConf {
    match level {
        0 => &TIGHT_CONF[0],
        1 => &TIGHT_CONF[1],
        2..=8 => &TIGHT_CONF[2],
        _ => &TIGHT_CONF[3],
    }
}

/// The four persistent zlib streams a Tight client rotates through.
pub struct TightStreams {
    streams: [Option<Compress>; 4],
    next: usize,
    level: u8,
}

impl Default for TightStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl TightStreams {
    /// Fresh streams at the default compression level.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: [None, None, None, None],
            next: 0,
            level: 1,
        }
    }

    /// The client's negotiated compression level (0-9).
    #[must_use]
    pub fn compress_level(&self) -> u8 {
        self.level
    }

    /// Applies a new compression level, dropping the streams when it
    /// actually changed so they restart at the new level.
    pub fn set_compress_level(&mut self, level: u8) {
        if level != self.level {
            self.level = level;
            self.streams = [None, None, None, None];
            self.next = 0;
        }
    }

    fn take_stream(&mut self) -> usize {
        let id = self.next;
        self.next = (self.next + 1) % 4;
        id
    }

    fn compress(&mut self, id: usize, zlib_level: u8, data: &[u8]) -> io::Result<Vec<u8>> {
        let stream = self.streams[id]
            .get_or_insert_with(|| Compress::new(Compression::new(u32::from(zlib_level)), true));
        compress_sync(stream, data)
    }
}

/// One wire rectangle produced by the Tight encoder: geometry relative
/// to the input rectangle plus the encoded payload.
pub struct TightRect {
    /// X offset within the input rectangle.
    pub x: u16,
    /// Y offset within the input rectangle.
    pub y: u16,
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
    /// Encoded payload, control byte first.
    pub data: BytesMut,
}

#[derive(Clone, Copy)]
struct Sub {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

/// Whether pixels travel packed to 3 bytes (TPIXEL).
fn pack24(format: &PixelFormat) -> bool {
    format.bits_per_pixel == 32
        && format.depth <= 24
        && format.red_max == 255
        && format.green_max == 255
        && format.blue_max == 255
}

fn put_tight_pixel(buf: &mut BytesMut, format: &PixelFormat, pixel: u32) {
    if pack24(format) {
        let (r, g, b) = format.pixel_to_rgb(pixel);
        buf.put_u8(r);
        buf.put_u8(g);
        buf.put_u8(b);
    } else {
        format.write_pixel(buf, pixel);
    }
}

fn tight_pixel_size(format: &PixelFormat) -> usize {
    if pack24(format) {
        3
    } else {
        format.bytes_per_pixel()
    }
}

/// Encodes one rectangle of translated pixels.
///
/// `quality` is the client's quality level: -1 for lossless, 0-9 to
/// allow JPEG. Returns the wire rectangles with offsets relative to the
/// input rectangle.
///
/// # Errors
///
/// Propagates compression failures; the caller abandons the update.
pub fn encode_rect(
    pixels: &[u32],
    format: &PixelFormat,
    width: u16,
    height: u16,
    quality: i8,
    streams: &mut TightStreams,
) -> io::Result<Vec<TightRect>> {
    let mut out = Vec::new();
    let rect = Sub { x: 0, y: 0, w: width, h: height };
    split_rect(pixels, width, format, rect, quality, streams, &mut out)?;
    Ok(out)
}

/// Hunts for large solid areas and recurses around them.
fn split_rect(
    pixels: &[u32],
    stride: u16,
    format: &PixelFormat,
    rect: Sub,
    quality: i8,
    streams: &mut TightStreams,
    out: &mut Vec<TightRect>,
) -> io::Result<()> {
    if (rect.w as usize) * (rect.h as usize) < MIN_SPLIT_RECT_SIZE {
        return encode_chunks(pixels, stride, format, rect, quality, streams, out);
    }

    let mut ty = rect.y;
    while ty < rect.y + rect.h {
        let th = MAX_SPLIT_TILE_SIZE.min(rect.y + rect.h - ty);
        let mut tx = rect.x;
        while tx < rect.x + rect.w {
            let tw = MAX_SPLIT_TILE_SIZE.min(rect.x + rect.w - tx);

            if let Some(color) = check_solid_tile(pixels, stride, tx, ty, tw, th, None) {
                let avail_w = rect.x + rect.w - tx;
                let avail_h = rect.y + rect.h - ty;
                let (w_best, h_best) =
                    find_best_solid_area(pixels, stride, tx, ty, avail_w, avail_h, color);

                // A small solid patch is not worth the extra rectangles
                // unless it covers everything that is left.
                if (w_best as usize) * (h_best as usize) < MIN_SOLID_SUBRECT_SIZE
                    && !(w_best == rect.w && h_best == rect.h)
                {
                    tx += tw;
                    continue;
                }

                let (sx, sy, sw, sh) =
                    extend_solid_area(pixels, stride, rect, color, tx, ty, w_best, h_best);

                if sy != rect.y {
                    let top = Sub { x: rect.x, y: rect.y, w: rect.w, h: sy - rect.y };
                    encode_chunks(pixels, stride, format, top, quality, streams, out)?;
                }
                if sx != rect.x {
                    let left = Sub { x: rect.x, y: sy, w: sx - rect.x, h: sh };
                    split_rect(pixels, stride, format, left, quality, streams, out)?;
                }

                let mut data = BytesMut::with_capacity(4);
                data.put_u8(CONTROL_FILL);
                put_tight_pixel(&mut data, format, color);
                debug!("tight fill {}x{} at ({},{})", sw, sh, sx, sy);
                out.push(TightRect { x: sx, y: sy, w: sw, h: sh, data });

                if sx + sw != rect.x + rect.w {
                    let right = Sub {
                        x: sx + sw,
                        y: sy,
                        w: rect.x + rect.w - sx - sw,
                        h: sh,
                    };
                    split_rect(pixels, stride, format, right, quality, streams, out)?;
                }
                if sy + sh != rect.y + rect.h {
                    let bottom = Sub {
                        x: rect.x,
                        y: sy + sh,
                        w: rect.w,
                        h: rect.y + rect.h - sy - sh,
                    };
                    split_rect(pixels, stride, format, bottom, quality, streams, out)?;
                }
                return Ok(());
            }

            tx += tw;
        }
        ty += th;
    }

    encode_chunks(pixels, stride, format, rect, quality, streams, out)
}

/// Slices a rectangle to the protocol ceilings and encodes each piece.
fn encode_chunks(
    pixels: &[u32],
    stride: u16,
    format: &PixelFormat,
    rect: Sub,
    quality: i8,
    streams: &mut TightStreams,
    out: &mut Vec<TightRect>,
) -> io::Result<()> {
    let max_w = rect.w.min(TIGHT_MAX_RECT_WIDTH);
    let max_h = ((TIGHT_MAX_RECT_SIZE / max_w as usize) as u16).max(1);

    let mut dy = 0;
    while dy < rect.h {
        let h = (rect.h - dy).min(max_h);
        let mut dx = 0;
        while dx < rect.w {
            let w = (rect.w - dx).min(max_w);
            let leaf = Sub { x: rect.x + dx, y: rect.y + dy, w, h };
            let r = encode_leaf(pixels, stride, format, leaf, quality, streams)?;
            out.push(r);
            dx += w;
        }
        dy += h;
    }
    Ok(())
}

/// Encodes one size-bounded rectangle, choosing the cheapest mode.
fn encode_leaf(
    pixels: &[u32],
    stride: u16,
    format: &PixelFormat,
    rect: Sub,
    quality: i8,
    streams: &mut TightStreams,
) -> io::Result<TightRect> {
    let words = extract_words(pixels, stride, rect);
    let conf = conf_for_level(streams.compress_level());

    let mut data = BytesMut::new();

    if let Some(color) = check_solid_color(&words) {
        data.put_u8(CONTROL_FILL);
        put_tight_pixel(&mut data, format, color);
        return Ok(TightRect { x: rect.x, y: rect.y, w: rect.w, h: rect.h, data });
    }

    let area = words.len();
    let palette_max = (area / conf.idx_max_colors_divisor).clamp(2, 256);

    if let Some(palette) = build_palette(&words, palette_max) {
        if palette.len() == 2 && area >= conf.mono_min_rect_size {
            encode_mono(&mut data, &words, rect.w, rect.h, format, &palette, conf, streams)?;
            return Ok(TightRect { x: rect.x, y: rect.y, w: rect.w, h: rect.h, data });
        }
        if palette.len() > 2 {
            encode_indexed(&mut data, &words, format, &palette, conf, streams)?;
            return Ok(TightRect { x: rect.x, y: rect.y, w: rect.w, h: rect.h, data });
        }
    }

    if quality >= 0 && format.depth >= 16 {
        encode_jpeg(&mut data, &words, rect.w, rect.h, format, quality, conf, streams)?;
    } else {
        encode_full_color(&mut data, &words, format, conf, streams)?;
    }
    Ok(TightRect { x: rect.x, y: rect.y, w: rect.w, h: rect.h, data })
}

fn extract_words(pixels: &[u32], stride: u16, rect: Sub) -> Vec<u32> {
    let stride = stride as usize;
    let mut words = Vec::with_capacity(rect.w as usize * rect.h as usize);
    for y in 0..rect.h as usize {
        let start = (rect.y as usize + y) * stride + rect.x as usize;
        words.extend_from_slice(&pixels[start..start + rect.w as usize]);
    }
    words
}

/// A block body: raw when too short to be worth a stream, compressed
/// through a rotated stream otherwise.
enum Block {
    Raw(Vec<u8>),
    Compressed(usize, Vec<u8>),
}

fn prepare_block(data: Vec<u8>, zlib_level: u8, streams: &mut TightStreams) -> io::Result<Block> {
    if data.len() < TIGHT_MIN_TO_COMPRESS {
        return Ok(Block::Raw(data));
    }
    let id = streams.take_stream();
    let compressed = streams.compress(id, zlib_level, &data)?;
    Ok(Block::Compressed(id, compressed))
}

fn write_block(buf: &mut BytesMut, control_flags: u8, head: impl FnOnce(&mut BytesMut), block: Block) {
    match block {
        Block::Raw(data) => {
            buf.put_u8(control_flags);
            head(buf);
            buf.put_slice(&data);
        }
        Block::Compressed(id, data) => {
            buf.put_u8(((id as u8) << 4) | control_flags);
            head(buf);
            write_compact_length(buf, data.len());
            buf.put_slice(&data);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_mono(
    buf: &mut BytesMut,
    words: &[u32],
    width: u16,
    height: u16,
    format: &PixelFormat,
    palette: &[u32],
    conf: &TightConf,
    streams: &mut TightStreams,
) -> io::Result<()> {
    // Majority colour becomes the background (bit 0).
    let count0 = words.iter().filter(|&&w| w == palette[0]).count();
    let (bg, fg) = if count0 * 2 >= words.len() {
        (palette[0], palette[1])
    } else {
        (palette[1], palette[0])
    };

    let bitmap = mono_bitmap(words, width, height, bg);
    let block = prepare_block(bitmap, conf.mono_zlib_level, streams)?;

    write_block(
        buf,
        CONTROL_EXPLICIT_FILTER,
        |buf| {
            buf.put_u8(FILTER_PALETTE);
            buf.put_u8(1); // palette size minus one
            put_tight_pixel(buf, format, bg);
            put_tight_pixel(buf, format, fg);
        },
        block,
    );
    debug!("tight mono {}x{}", width, height);
    Ok(())
}

fn encode_indexed(
    buf: &mut BytesMut,
    words: &[u32],
    format: &PixelFormat,
    palette: &[u32],
    conf: &TightConf,
    streams: &mut TightStreams,
) -> io::Result<()> {
    let mut indices = Vec::with_capacity(words.len());
    for &word in words {
        let idx = palette.iter().position(|&c| c == word).unwrap_or(0);
        indices.push(idx as u8);
    }
    let block = prepare_block(indices, conf.idx_zlib_level, streams)?;

    write_block(
        buf,
        CONTROL_EXPLICIT_FILTER,
        |buf| {
            buf.put_u8(FILTER_PALETTE);
            buf.put_u8((palette.len() - 1) as u8);
            for &color in palette {
                put_tight_pixel(buf, format, color);
            }
        },
        block,
    );
    debug!("tight indexed, {} colours", palette.len());
    Ok(())
}

fn encode_full_color(
    buf: &mut BytesMut,
    words: &[u32],
    format: &PixelFormat,
    conf: &TightConf,
    streams: &mut TightStreams,
) -> io::Result<()> {
    let mut raw = BytesMut::with_capacity(words.len() * tight_pixel_size(format));
    for &word in words {
        put_tight_pixel(&mut raw, format, word);
    }
    let block = prepare_block(raw.to_vec(), conf.raw_zlib_level, streams)?;
    write_block(buf, 0, |_| {}, block);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_jpeg(
    buf: &mut BytesMut,
    words: &[u32],
    width: u16,
    height: u16,
    format: &PixelFormat,
    quality: i8,
    conf: &TightConf,
    streams: &mut TightStreams,
) -> io::Result<()> {
    #[cfg(feature = "turbojpeg")]
    {
        use crate::jpeg::TurboJpegEncoder;

        let mut rgb = Vec::with_capacity(words.len() * 3);
        for &word in words {
            let (r, g, b) = format.pixel_to_rgb(word);
            rgb.push(r);
            rgb.push(g);
            rgb.push(b);
        }

        let jpeg_quality = QUALITY_TO_JPEG[quality.clamp(0, 9) as usize];
        match TurboJpegEncoder::new().and_then(|mut enc| enc.compress_rgb(&rgb, width, height, jpeg_quality)) {
            Ok(jpeg) => {
                buf.put_u8(CONTROL_JPEG);
                write_compact_length(buf, jpeg.len());
                buf.put_slice(&jpeg);
                debug!("tight jpeg {}x{} q{}", width, height, jpeg_quality);
                return Ok(());
            }
            Err(e) => {
                debug!("jpeg compression unavailable ({}), sending full colour", e);
            }
        }
    }

    let _ = (width, height, quality);
    encode_full_color(buf, words, format, conf, streams)
}

/// Packs a two-colour rectangle to one bit per pixel, MSB first, each
/// row byte-aligned. Bits are set where the pixel differs from `bg`.
fn mono_bitmap(words: &[u32], width: u16, height: u16, bg: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let row_bytes = (w + 7) / 8;
    let mut bitmap = vec![0u8; row_bytes * h];

    for y in 0..h {
        for x in 0..w {
            if words[y * w + x] != bg {
                bitmap[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
            }
        }
    }
    bitmap
}

/// Tight's 1-3 byte compact length: 7 bits per byte, bit 7 continues.
fn write_compact_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len < 16384 {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 7) as u8);
    } else {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((((len >> 7) & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 14) as u8);
    }
}

fn check_solid_tile(
    pixels: &[u32],
    stride: u16,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    need_same_color: Option<u32>,
) -> Option<u32> {
    let stride = stride as usize;
    let first = pixels[y as usize * stride + x as usize];
    if let Some(required) = need_same_color {
        if first != required {
            return None;
        }
    }
    for dy in 0..h as usize {
        let row = (y as usize + dy) * stride + x as usize;
        for dx in 0..w as usize {
            if pixels[row + dx] != first {
                return None;
            }
        }
    }
    Some(first)
}

/// Grows a solid area tile by tile from its top-left corner, keeping the
/// largest rectangle seen.
fn find_best_solid_area(
    pixels: &[u32],
    stride: u16,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    color: u32,
) -> (u16, u16) {
    let mut w_best = 0;
    let mut h_best = 0;
    let mut w_prev = w;

    let mut dy = 0;
    while dy < h {
        let th = (h - dy).min(MAX_SPLIT_TILE_SIZE);
        let tw = w_prev.min(MAX_SPLIT_TILE_SIZE);

        if check_solid_tile(pixels, stride, x, y + dy, tw, th, Some(color)).is_none() {
            break;
        }

        let mut dx = tw;
        while dx < w_prev {
            let tw_next = (w_prev - dx).min(MAX_SPLIT_TILE_SIZE);
            if check_solid_tile(pixels, stride, x + dx, y + dy, tw_next, th, Some(color)).is_none()
            {
                break;
            }
            dx += tw_next;
        }

        w_prev = dx;
        if (w_prev as usize) * ((dy + th) as usize) > (w_best as usize) * (h_best as usize) {
            w_best = w_prev;
            h_best = dy + th;
        }

        dy += th;
    }

    (w_best, h_best)
}

/// Stretches a solid area one row or column at a time in all four
/// directions within `bounds`.
#[allow(clippy::too_many_arguments)]
fn extend_solid_area(
    pixels: &[u32],
    stride: u16,
    bounds: Sub,
    color: u32,
    mut x: u16,
    mut y: u16,
    mut w: u16,
    mut h: u16,
) -> (u16, u16, u16, u16) {
    while y > bounds.y
        && check_solid_tile(pixels, stride, x, y - 1, w, 1, Some(color)).is_some()
    {
        y -= 1;
        h += 1;
    }
    while y + h < bounds.y + bounds.h
        && check_solid_tile(pixels, stride, x, y + h, w, 1, Some(color)).is_some()
    {
        h += 1;
    }
    while x > bounds.x
        && check_solid_tile(pixels, stride, x - 1, y, 1, h, Some(color)).is_some()
    {
        x -= 1;
        w += 1;
    }
    while x + w < bounds.x + bounds.w
        && check_solid_tile(pixels, stride, x + w, y, 1, h, Some(color)).is_some()
    {
        w += 1;
    }
    (x, y, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn read_compact_length(data: &[u8]) -> (usize, usize) {
        let mut len = usize::from(data[0] & 0x7F);
        let mut used = 1;
        if data[0] & 0x80 != 0 {
            len |= usize::from(data[1] & 0x7F) << 7;
            used = 2;
            if data[1] & 0x80 != 0 {
                len |= usize::from(data[2]) << 14;
                used = 3;
            }
        }
        (len, used)
    }

    fn inflate(data: &[u8], expected: usize) -> Vec<u8> {
        let mut inflater = Decompress::new(true);
        let mut out = vec![0u8; expected + 64];
        inflater
            .decompress(data, &mut out, FlushDecompress::Sync)
            .unwrap();
        out.truncate(inflater.total_out() as usize);
        out
    }

    #[test]
    fn solid_rect_is_a_fill() {
        let mut streams = TightStreams::new();
        let pixels = vec![0x0000_FF00u32; 8 * 8];
        let rects =
            encode_rect(&pixels, &PixelFormat::rgb32(), 8, 8, -1, &mut streams).unwrap();
        assert_eq!(rects.len(), 1);
        // Fill control byte plus one packed 24-bit pixel (green).
        assert_eq!(&rects[0].data[..], &[0x80, 0x00, 0xFF, 0x00]);
    }

    #[test]
    fn mono_rect_wire_shape() {
        // 16x16 with two colours: 192 of A in the top 12 rows, 64 of B
        // below. Compress level 1, lossless quality.
        let mut streams = TightStreams::new();
        streams.set_compress_level(1);
        let a = 0x0011_2233u32;
        let b = 0x00AA_BBCCu32;
        let mut pixels = vec![a; 16 * 12];
        pixels.extend(vec![b; 16 * 4]);

        let rects =
            encode_rect(&pixels, &PixelFormat::rgb32(), 16, 16, -1, &mut streams).unwrap();
        assert_eq!(rects.len(), 1);
        let data = &rects[0].data;

        // Stream 0, explicit filter; palette filter with two colours,
        // majority colour first.
        assert_eq!(data[0], 0x40);
        assert_eq!(data[1], FILTER_PALETTE);
        assert_eq!(data[2], 1);
        assert_eq!(&data[3..6], &[0x11, 0x22, 0x33]);
        assert_eq!(&data[6..9], &[0xAA, 0xBB, 0xCC]);

        // Compact length, then a zlib block holding the 32-byte bitmap.
        let (len, used) = read_compact_length(&data[9..]);
        assert_eq!(data.len(), 9 + used + len);
        let bitmap = inflate(&data[9 + used..], 32);
        assert_eq!(bitmap.len(), 32);
        // Rows of A are zero bits, rows of B all-ones.
        assert_eq!(&bitmap[..24], &[0u8; 24][..]);
        assert_eq!(&bitmap[24..], &[0xFFu8; 8][..]);
    }

    #[test]
    fn streams_rotate_per_compressed_block() {
        let mut streams = TightStreams::new();
        // Three noisy 16x16 rects in a row, each needing a compressed
        // full-colour block.
        for expected_stream in 0..3u8 {
            let pixels: Vec<u32> = (0..256u32).map(|i| i * 97 + u32::from(expected_stream)).collect();
            let rects =
                encode_rect(&pixels, &PixelFormat::rgb32(), 16, 16, -1, &mut streams).unwrap();
            assert_eq!(rects.len(), 1);
            // Full colour: no filter bit, stream id in bits 4-5.
            assert_eq!(rects[0].data[0], expected_stream << 4);
        }
    }

    #[test]
    fn indexed_rect_lists_palette() {
        let mut streams = TightStreams::new();
        streams.set_compress_level(0); // divisor 4 admits palettes up to 64
        let colors = [0x10u32, 0x20, 0x30, 0x40];
        let pixels: Vec<u32> = (0..256).map(|i| colors[(i / 64) as usize]).collect();
        let rects =
            encode_rect(&pixels, &PixelFormat::rgb32(), 16, 16, -1, &mut streams).unwrap();
        let data = &rects[0].data;
        assert_eq!(data[0] & 0x40, 0x40);
        assert_eq!(data[1], FILTER_PALETTE);
        assert_eq!(data[2], 3); // four colours minus one
        // Four packed palette entries follow.
        assert_eq!(&data[3..6], &[0x00, 0x00, 0x10]);
        assert_eq!(&data[12..15], &[0x00, 0x00, 0x40]);
    }

    #[test]
    fn large_solid_area_splits_out_a_fill() {
        // 64x128: top half noisy, bottom half solid.
        let mut streams = TightStreams::new();
        let mut pixels: Vec<u32> = (0..64u32 * 64).map(|i| i * 31 + 7).collect();
        pixels.extend(vec![0x00AB_CDEFu32; 64 * 64]);

        let rects =
            encode_rect(&pixels, &PixelFormat::rgb32(), 64, 128, -1, &mut streams).unwrap();
        let fill = rects
            .iter()
            .find(|r| r.data.len() == 4 && r.data[0] == 0x80)
            .expect("a fill rectangle");
        assert_eq!((fill.x, fill.y, fill.w, fill.h), (0, 64, 64, 64));

        // Every emitted rectangle stays inside the input and they tile it.
        let area: usize = rects.iter().map(|r| r.w as usize * r.h as usize).sum();
        assert_eq!(area, 64 * 128);
    }

    #[test]
    fn compact_length_boundaries() {
        let mut buf = BytesMut::new();
        write_compact_length(&mut buf, 127);
        assert_eq!(&buf[..], &[127]);
        buf.clear();
        write_compact_length(&mut buf, 128);
        assert_eq!(&buf[..], &[0x80, 1]);
        buf.clear();
        write_compact_length(&mut buf, 16384);
        assert_eq!(&buf[..], &[0x80, 0x80, 1]);
    }
}
