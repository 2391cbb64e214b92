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

//! RFB (Remote Framebuffer) protocol constants and wire structures.
//!
//! This module provides the building blocks for RFB 3.3 communication:
//! the version banner, message tags, authentication schemes, encoding
//! identifiers, and the pixel format descriptor with its packing helpers.
//!
//! # Protocol Overview
//!
//! An RFB 3.3 session passes through the following phases:
//! 1. **Protocol Version** - both ends exchange a 12-byte banner
//! 2. **Authentication** - the server picks the scheme (none or VNC auth)
//! 3. **Initialisation** - ClientInit (shared flag) and ServerInit
//! 4. **Normal Operation** - input events in, framebuffer updates out

use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// The RFB protocol version banner sent by the server.
///
/// This server speaks the 3.3-class protocol: the server chooses the
/// authentication scheme and announces it as a single 4-byte word. The
/// banner must be exactly 12 bytes including the newline.
pub const PROTOCOL_VERSION: &str = "RFB 003.003\n";

// Client-to-Server Message Types

/// Message type: client requests a different pixel format for updates.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: client wants to change colour map entries.
///
/// Clients never legitimately send this to a server with a fixed palette;
/// receiving it is a protocol error and closes the connection.
pub const CLIENT_MSG_FIX_COLOUR_MAP_ENTRIES: u8 = 1;

/// Message type: client lists the encodings it supports, in preference order.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: client requests a framebuffer update (incremental or full).
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: server sets colour map entries (palette modes only).
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;

/// Message type: server rings the bell.
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Authentication schemes (RFB 3.3: a single big-endian u32 from the server)

/// Authentication word: connection failed; a reason string follows.
pub const AUTH_CONN_FAILED: u32 = 0;

/// Authentication word: no authentication required.
pub const AUTH_NONE: u32 = 1;

/// Authentication word: VNC challenge/response authentication follows.
pub const AUTH_VNC: u32 = 2;

/// Authentication result: success.
pub const AUTH_RESULT_OK: u32 = 0;

/// Authentication result: the challenge response did not match.
pub const AUTH_RESULT_FAILED: u32 = 1;

// Encoding Types

/// Encoding type: raw pixel data, row by row.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: copy a rectangle from elsewhere on the client's screen.
pub const ENCODING_COPYRECT: i32 = 1;

/// Encoding type: rise-and-run-length encoding.
pub const ENCODING_RRE: i32 = 2;

/// Encoding type: compact RRE with 8-bit subrectangle geometry.
pub const ENCODING_CORRE: i32 = 4;

/// Encoding type: Hextile, 16x16 tiles with per-tile subencodings.
pub const ENCODING_HEXTILE: i32 = 5;

/// Encoding type: zlib-compressed raw pixels with a persistent stream.
pub const ENCODING_ZLIB: i32 = 6;

/// Encoding type: Tight, palette/mono/full-colour/JPEG with four streams.
pub const ENCODING_TIGHT: i32 = 7;

/// Encoding type: zlib-compressed Hextile. Recognised but not served.
pub const ENCODING_ZLIBHEX: i32 = 8;

/// Encoding type: Zlib Run-Length Encoding over 64x64 tiles.
pub const ENCODING_ZRLE: i32 = 16;

/// Pseudo-encoding: X-style cursor shape updates (bitmap + mask).
pub const ENCODING_XCURSOR: i32 = -240;

/// Pseudo-encoding: rich cursor shape updates (client-format pixels + mask).
pub const ENCODING_RICH_CURSOR: i32 = -239;

/// Pseudo-encoding: server-side pointer position updates.
pub const ENCODING_POINTER_POS: i32 = -232;

/// Pseudo-encoding: zero-geometry terminator closing an open-ended update.
pub const ENCODING_LAST_RECT: i32 = -224;

/// Pseudo-encoding: compression level 0 (fastest).
pub const ENCODING_COMPRESS_LEVEL_0: i32 = -256;

/// Pseudo-encoding: compression level 9 (best).
pub const ENCODING_COMPRESS_LEVEL_9: i32 = -247;

/// Pseudo-encoding: JPEG quality level 0 (lowest quality).
pub const ENCODING_QUALITY_LEVEL_0: i32 = -32;

/// Pseudo-encoding: JPEG quality level 9 (highest quality).
pub const ENCODING_QUALITY_LEVEL_9: i32 = -23;

// Hextile subencoding flags

/// Hextile: raw pixel data for this tile.
pub const HEXTILE_RAW: u8 = 1 << 0;

/// Hextile: background colour is specified.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 1 << 1;

/// Hextile: foreground colour is specified.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 1 << 2;

/// Hextile: tile contains subrectangles.
pub const HEXTILE_ANY_SUBRECTS: u8 = 1 << 3;

/// Hextile: subrectangles carry their own colours.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 1 << 4;

/// Progress of a client through the RFB handshake.
///
/// The state only ever advances; any error closes the client instead of
/// regressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    /// Waiting for the client's 12-byte version banner.
    ProtocolVersion,
    /// Waiting for the 16-byte challenge response.
    Authentication,
    /// Waiting for the ClientInit shared flag.
    Initialisation,
    /// Normal message exchange.
    Normal,
}

/// How a 32bpp pixel maps onto the 3-byte compact forms used by Tight
/// (Pack24) and ZRLE (CPIXEL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactPixel {
    /// No compact form; pixels go out at their full width.
    Full,
    /// All significant bits live in the three low-order bytes.
    Low3,
    /// All significant bits live in the three high-order bytes.
    High3,
}

/// Describes how pixel values encode colour.
///
/// Matches the 16-byte wire representation used in ServerInit and
/// SetPixelFormat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel on the wire: 8, 16 or 32.
    pub bits_per_pixel: u8,
    /// Number of significant bits in a pixel.
    pub depth: u8,
    /// Non-zero if multi-byte pixels are big-endian.
    pub big_endian_flag: u8,
    /// Non-zero if pixels encode colour directly; zero for palette indices.
    pub true_colour_flag: u8,
    /// Maximum red value (power of two minus one).
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Left shift of the red component within the pixel word.
    pub red_shift: u8,
    /// Left shift of the green component.
    pub green_shift: u8,
    /// Left shift of the blue component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Standard 32-bit true-colour format with 0xRRGGBB pixel words.
    ///
    /// This is the default server format.
    #[must_use]
    pub fn rgb32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// 16-bit RGB565: 5 bits red, 6 bits green, 5 bits blue.
    #[must_use]
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// 8-bit BGR233: 2 bits blue, 3 bits green, 3 bits red.
    ///
    /// Installed on colour-mapped clients via a synthetic palette so the
    /// translator can treat them as true colour.
    #[must_use]
    pub fn bgr233() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    /// 8-bit colour-mapped format (pixels are palette indices).
    #[must_use]
    pub fn colour_map8() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_colour_flag: 0,
            red_max: 0,
            green_max: 0,
            blue_max: 0,
            red_shift: 0,
            green_shift: 0,
            blue_shift: 0,
        }
    }

    /// Bytes per pixel on the wire.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// Whether two formats describe the same bit layout.
    ///
    /// Endianness is irrelevant for single-byte pixels, and the colour
    /// fields are irrelevant for colour-mapped formats.
    #[must_use]
    pub fn equals(&self, other: &PixelFormat) -> bool {
        self.bits_per_pixel == other.bits_per_pixel
            && self.depth == other.depth
            && ((self.big_endian_flag != 0) == (other.big_endian_flag != 0)
                || self.bits_per_pixel == 8)
            && (self.true_colour_flag != 0) == (other.true_colour_flag != 0)
            && (self.true_colour_flag == 0
                || (self.red_max == other.red_max
                    && self.green_max == other.green_max
                    && self.blue_max == other.blue_max
                    && self.red_shift == other.red_shift
                    && self.green_shift == other.green_shift
                    && self.blue_shift == other.blue_shift))
    }

    /// Validates that this format is one the server can translate to.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.bits_per_pixel != 8 && self.bits_per_pixel != 16 && self.bits_per_pixel != 32 {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }
        // Colour-mapped clients are only supported at 8bpp.
        if self.true_colour_flag == 0 {
            return self.bits_per_pixel == 8;
        }
        // Max values must be 2^n - 1 and the shifted components must fit.
        for (max, shift) in [
            (u32::from(self.red_max), self.red_shift),
            (u32::from(self.green_max), self.green_shift),
            (u32::from(self.blue_max), self.blue_shift),
        ] {
            if max == 0 || (max & (max + 1)) != 0 {
                return false;
            }
            let bits = 32 - max.leading_zeros();
            if u32::from(shift) + bits > u32::from(self.bits_per_pixel) {
                return false;
            }
        }
        true
    }

    /// Packs 8-bit RGB components into a pixel value in this format.
    #[must_use]
    pub fn rgb_to_pixel(&self, r: u8, g: u8, b: u8) -> u32 {
        let scale = |v: u8, max: u16| -> u32 {
            if max == 255 {
                u32::from(v)
            } else {
                (u32::from(v) * u32::from(max) + 127) / 255
            }
        };
        (scale(r, self.red_max) << self.red_shift)
            | (scale(g, self.green_max) << self.green_shift)
            | (scale(b, self.blue_max) << self.blue_shift)
    }

    /// Extracts 8-bit RGB components from a pixel value in this format.
    #[must_use]
    pub fn pixel_to_rgb(&self, pixel: u32) -> (u8, u8, u8) {
        let extract = |shift: u8, max: u16| -> u8 {
            if max == 0 {
                return 0;
            }
            let v = (pixel >> shift) & u32::from(max);
            if max == 255 {
                v as u8
            } else {
                ((v * 255 + u32::from(max) / 2) / u32::from(max)) as u8
            }
        };
        (
            extract(self.red_shift, self.red_max),
            extract(self.green_shift, self.green_max),
            extract(self.blue_shift, self.blue_max),
        )
    }

    /// Serialises a pixel value into `buf` honouring width and endianness.
    pub fn write_pixel(&self, buf: &mut BytesMut, pixel: u32) {
        match self.bits_per_pixel {
            8 => buf.put_u8(pixel as u8),
            16 => {
                if self.big_endian_flag != 0 {
                    buf.put_u16(pixel as u16);
                } else {
                    buf.put_u16_le(pixel as u16);
                }
            }
            _ => {
                if self.big_endian_flag != 0 {
                    buf.put_u32(pixel);
                } else {
                    buf.put_u32_le(pixel);
                }
            }
        }
    }

    /// Reads one pixel value from raw framebuffer bytes in this format.
    #[must_use]
    pub fn read_pixel(&self, bytes: &[u8]) -> u32 {
        match self.bits_per_pixel {
            8 => u32::from(bytes[0]),
            16 => {
                if self.big_endian_flag != 0 {
                    u32::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                } else {
                    u32::from(u16::from_le_bytes([bytes[0], bytes[1]]))
                }
            }
            _ => {
                if self.big_endian_flag != 0 {
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                } else {
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                }
            }
        }
    }

    /// Determines whether 32bpp pixels in this format can travel as three
    /// bytes, and which three.
    #[must_use]
    pub fn compact_pixel(&self) -> CompactPixel {
        if self.bits_per_pixel != 32 || self.true_colour_flag == 0 || self.depth > 24 {
            return CompactPixel::Full;
        }
        let used = (u32::from(self.red_max) << self.red_shift)
            | (u32::from(self.green_max) << self.green_shift)
            | (u32::from(self.blue_max) << self.blue_shift);
        if used & 0xFF00_0000 == 0 {
            CompactPixel::Low3
        } else if used & 0x0000_00FF == 0 {
            CompactPixel::High3
        } else {
            CompactPixel::Full
        }
    }

    /// Serialises a pixel in the 3-byte compact form selected by
    /// [`PixelFormat::compact_pixel`], or at full width when none applies.
    pub fn write_compact_pixel(&self, buf: &mut BytesMut, pixel: u32) {
        let bytes = if self.big_endian_flag != 0 {
            pixel.to_be_bytes()
        } else {
            pixel.to_le_bytes()
        };
        match self.compact_pixel() {
            CompactPixel::Full => self.write_pixel(buf, pixel),
            CompactPixel::Low3 => {
                // Payload sits in the low bytes of the pixel word.
                if self.big_endian_flag != 0 {
                    buf.put_slice(&bytes[1..4]);
                } else {
                    buf.put_slice(&bytes[0..3]);
                }
            }
            CompactPixel::High3 => {
                if self.big_endian_flag != 0 {
                    buf.put_slice(&bytes[0..3]);
                } else {
                    buf.put_slice(&bytes[1..4]);
                }
            }
        }
    }

    /// Size in bytes of one compact pixel.
    #[must_use]
    pub fn compact_pixel_size(&self) -> usize {
        match self.compact_pixel() {
            CompactPixel::Full => self.bytes_per_pixel(),
            _ => 3,
        }
    }

    /// Writes the 16-byte wire representation into `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Reads a `PixelFormat` from its 16-byte wire representation.
    ///
    /// # Errors
    ///
    /// Returns `Err` if fewer than 16 bytes are available.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough bytes for PixelFormat",
            ));
        }

        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// Colour palette for colour-mapped pixel formats: up to 256 entries of
/// 16-bit RGB.
#[derive(Debug, Clone, Default)]
pub struct ColourMap {
    /// Palette entries as `(red, green, blue)` triples.
    pub entries: Vec<(u16, u16, u16)>,
}

impl ColourMap {
    /// The synthetic BGR233 palette installed on colour-mapped clients.
    #[must_use]
    pub fn bgr233() -> Self {
        let mut entries = Vec::with_capacity(256);
        for i in 0..256u32 {
            let r = (i & 7) * 65535 / 7;
            let g = ((i >> 3) & 7) * 65535 / 7;
            let b = ((i >> 6) & 3) * 65535 / 3;
            entries.push((r as u16, g as u16, b as u16));
        }
        Self { entries }
    }

    /// Serialises a SetColourMapEntries message covering the whole map.
    pub fn write_entries_msg(&self, buf: &mut BytesMut) {
        buf.put_u8(SERVER_MSG_SET_COLOUR_MAP_ENTRIES);
        buf.put_u8(0); // padding
        buf.put_u16(0); // first colour
        buf.put_u16(self.entries.len() as u16);
        for &(r, g, b) in &self.entries {
            buf.put_u16(r);
            buf.put_u16(g);
            buf.put_u16(b);
        }
    }
}

/// The ServerInit message sent once the handshake completes.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// Height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// The desktop name shown in the viewer's title bar.
    pub name: String,
}

impl ServerInit {
    /// Serialises the message: width, height, 16-byte pixel format,
    /// length-prefixed name.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// Rectangle header inside a framebuffer update: position, size and the
/// encoding of the payload that follows.
#[derive(Debug)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Encoding identifier for the payload.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_roundtrip() {
        let pf = PixelFormat::rgb565();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let parsed = PixelFormat::from_bytes(&mut buf).unwrap();
        assert!(pf.equals(&parsed));
    }

    #[test]
    fn rgb32_packing() {
        let pf = PixelFormat::rgb32();
        let pixel = pf.rgb_to_pixel(0x12, 0x34, 0x56);
        assert_eq!(pixel, 0x0012_3456);
        assert_eq!(pf.pixel_to_rgb(pixel), (0x12, 0x34, 0x56));
    }

    #[test]
    fn rgb565_packing() {
        let pf = PixelFormat::rgb565();
        assert_eq!(pf.rgb_to_pixel(255, 0, 0), 0xF800);
        assert_eq!(pf.rgb_to_pixel(0, 255, 0), 0x07E0);
        assert_eq!(pf.rgb_to_pixel(0, 0, 255), 0x001F);
    }

    #[test]
    fn compact_pixel_detection() {
        assert_eq!(PixelFormat::rgb32().compact_pixel(), CompactPixel::Low3);
        assert_eq!(PixelFormat::rgb565().compact_pixel(), CompactPixel::Full);

        let mut high = PixelFormat::rgb32();
        high.red_shift = 24;
        high.green_shift = 16;
        high.blue_shift = 8;
        assert_eq!(high.compact_pixel(), CompactPixel::High3);
    }

    #[test]
    fn compact_pixel_bytes() {
        let pf = PixelFormat::rgb32();
        let mut buf = BytesMut::new();
        pf.write_compact_pixel(&mut buf, 0x0011_2233);
        // Little-endian 0x00112233 is [33, 22, 11, 00]; the low three
        // bytes carry the payload.
        assert_eq!(&buf[..], &[0x33, 0x22, 0x11]);
    }

    #[test]
    fn validity_checks() {
        assert!(PixelFormat::rgb32().is_valid());
        assert!(PixelFormat::rgb565().is_valid());
        assert!(PixelFormat::bgr233().is_valid());
        assert!(PixelFormat::colour_map8().is_valid());

        let mut bad = PixelFormat::rgb32();
        bad.bits_per_pixel = 24;
        assert!(!bad.is_valid());

        let mut mapped16 = PixelFormat::colour_map8();
        mapped16.bits_per_pixel = 16;
        assert!(!mapped16.is_valid());

        let mut lopsided = PixelFormat::rgb565();
        lopsided.red_max = 30; // not 2^n - 1
        assert!(!lopsided.is_valid());
    }
}
