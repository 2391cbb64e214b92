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

//! # rfbserver
//!
//! A pure Rust implementation of the core of an RFB (VNC) server: the
//! wire-protocol state machine, per-client dirty-region tracking, pixel
//! format translation, and the full rectangle-encoder suite.
//!
//! The library accepts TCP connections from VNC viewers, negotiates an
//! RFB 3.3 session, tracks what each client has seen, and converges
//! every viewer to the current framebuffer with the smallest practical
//! stream of update messages.
//!
//! ## Features
//!
//! - **Encodings**: Raw, CopyRect, RRE, CoRRE, Hextile, Zlib, Tight
//!   (solid/mono/indexed/full-colour/JPEG) and ZRLE, plus the LastRect,
//!   cursor-shape (XCursor/RichCursor), pointer-position, compression-
//!   and quality-level pseudo-encodings
//! - **Pixel formats**: 8, 16 and 32 bit clients and servers, colour
//!   maps included, with lookup-table translation
//! - **Region tracking**: banded region algebra keeps per-client
//!   modified, copy and requested regions minimal
//! - **Async I/O**: one Tokio task per client; a slow viewer never
//!   stalls the rest
//! - **VNC authentication**: DES challenge/response and classic 8-byte
//!   password files
//!
//! ## Quick Start
//!
//! ```no_run
//! use rfbserver::VncServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Create a VNC server with a 1280x800 framebuffer
//!     let server = VncServer::new(1280, 800);
//!
//!     // Optional: set a password
//!     server.set_password(Some("secret".to_string())).await;
//!
//!     // Start listening on port 5900
//!     let listener = server.clone();
//!     tokio::spawn(async move { listener.listen(5900).await });
//!
//!     // Paint and publish changes
//!     // server.update_framebuffer(&pixels, 0, 0, 1280, 800).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Host application              │
//! │  paints pixels, consumes input events    │
//! └───────────────────┬──────────────────────┘
//!                     │ mark_rect_modified / events()
//!                     ▼
//! ┌──────────────────────────────────────────┐
//! │             VncServer                    │
//! │  listener, client registry, policies     │
//! └───────┬───────────┬───────────┬──────────┘
//!         ▼           ▼           ▼
//!    ┌─────────┐ ┌─────────┐ ┌─────────┐
//!    │Client  1│ │Client  2│ │Client  N│   one task each:
//!    └────┬────┘ └────┬────┘ └────┬────┘   parse + schedule + encode
//!         └───────────┴───────────┘
//!                     │ dirty-region fan-out
//!                     ▼
//! ┌──────────────────────────────────────────┐
//! │        Framebuffer (shared)              │
//! │  pixels, colour map, software cursor     │
//! └──────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cursor;
pub mod encoding;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod jpeg;
pub mod protocol;
pub mod region;
pub mod server;
pub mod stats;

// Internal modules
mod client;
mod translate;

// Re-exports
pub use cursor::Cursor;
pub use error::{Result, VncError};
pub use events::{NewClientAction, ServerEvent};
pub use framebuffer::Framebuffer;
pub use protocol::{ColourMap, PixelFormat};
pub use region::{Rect, Region};
pub use server::{SharePolicy, VncServer};

#[cfg(feature = "turbojpeg")]
pub use jpeg::TurboJpegEncoder;

/// RFB protocol version banner.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
