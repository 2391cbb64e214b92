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

//! Rectangle encoders for framebuffer updates.
//!
//! Every encoder consumes pixels that have already been translated into
//! the client's format, as 32-bit pixel *values* plus the [`PixelFormat`]
//! that dictates how values serialise to bytes. Stateless encoders
//! implement the [`Encoding`] trait; Zlib, Tight and ZRLE carry
//! per-client compression streams and expose free functions instead.

use crate::protocol::PixelFormat;
use bytes::BytesMut;

pub mod common;
pub mod corre;
pub mod hextile;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod zlib;
pub mod zrle;

pub use common::Subrect;
pub use corre::CorRreEncoding;
pub use hextile::HextileEncoding;
pub use raw::RawEncoding;
pub use rre::RreEncoding;
pub use tight::{TightRect, TightStreams};
pub use zlib::encode_zlib_persistent;
pub use zrle::encode_zrle_persistent;

/// Interface for stateless rectangle encoders.
pub trait Encoding {
    /// Encodes a rectangle of client-format pixel values.
    ///
    /// `pixels` holds `width * height` translated values in row-major
    /// order; `format` controls serialisation. The returned buffer is the
    /// rectangle payload without the 12-byte header.
    fn encode(&self, pixels: &[u32], format: &PixelFormat, width: u16, height: u16) -> BytesMut;
}
