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

//! Per-client protocol handling: handshake, inbound message loop, and
//! the update scheduler.
//!
//! One task owns each client. After the RFB 3.3 handshake, the task
//! loops in `tokio::select!` over three sources: bytes from the viewer
//! (parsed incrementally out of a `BytesMut`), wake-ups from the
//! client's [`UpdateTracker`] when a producer marked something dirty,
//! and control messages from the server (cut text, bell, close). Updates
//! are deferred briefly so bursts of small changes coalesce into one
//! message.
//!
//! # Update composition
//!
//! When the deferral window closes, the pending regions are folded per
//! the classic scheme: dirty pixels are removed from the copy region,
//! the update is clipped to what the client asked for, the copyable part
//! is clipped again to the translated request (both source and
//! destination must be known to the client), and whatever stays dirty
//! outside the request is retained for later. CopyRect rectangles go out
//! first, in an order that keeps unread source pixels intact, then the
//! remaining rectangles in the client's preferred encoding.

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression};
use log::{debug, error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::auth::{VncAuth, CHALLENGE_SIZE};
use crate::encoding::{
    self, encode_zlib_persistent, encode_zrle_persistent, CorRreEncoding, Encoding,
    HextileEncoding, RawEncoding, RreEncoding, TightStreams,
};
use crate::error::{Result, VncError};
use crate::framebuffer::{Framebuffer, UpdateTracker};
use crate::protocol::*;
use crate::region::{Rect, Region};
use crate::stats::ClientStats;
use crate::translate::Translator;

/// How long the client may take to answer the authentication challenge.
const AUTH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Cut text larger than this closes the client.
const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// Cadence of the output check while idle.
const CHECK_INTERVAL: Duration = Duration::from_millis(16);

/// Parent tile ceiling for CoRRE subrectangle geometry.
const CORRE_MAX_WIDTH: u16 = 48;
/// See [`CORRE_MAX_WIDTH`].
const CORRE_MAX_HEIGHT: u16 = 48;

/// Events a client connection reports to the server.
pub enum ClientEvent {
    /// A key press or release.
    KeyPress {
        /// True when pressed.
        down: bool,
        /// X keysym.
        key: u32,
    },
    /// Pointer state from the viewer.
    PointerMove {
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
        /// Pressed-button bitmask.
        button_mask: u8,
    },
    /// Clipboard content from the viewer.
    CutText {
        /// The text.
        text: String,
    },
}

/// Server-to-client control messages, injected into the client task.
pub enum ControlMessage {
    /// Send a ServerCutText message.
    CutText(String),
    /// Ring the viewer's bell.
    Bell,
    /// Close the connection.
    Close,
}

/// State and I/O for one connected viewer.
pub struct VncClient {
    stream: TcpStream,
    framebuffer: Framebuffer,
    tracker: Arc<UpdateTracker>,
    client_id: usize,
    host: String,
    state: ClientState,
    reverse_connection: bool,
    translator: Translator,
    needs_colour_map: bool,
    preferred_encoding: i32,
    enable_cursor_shape: bool,
    use_rich_cursor: bool,
    enable_last_rect: bool,
    enable_pointer_pos: bool,
    quality_level: i8,
    zlib_level: u8,
    zlib_stream: Option<Compress>,
    zrle_stream: Option<Compress>,
    tight_streams: TightStreams,
    defer_update: Duration,
    defer_started: Option<Instant>,
    stats: ClientStats,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl VncClient {
    /// Runs the RFB 3.3 handshake on a fresh connection.
    ///
    /// Returns the ready client and the ClientInit `shared` flag; the
    /// caller applies the share policy and registers the tracker before
    /// calling [`VncClient::run`].
    ///
    /// # Errors
    ///
    /// Any I/O failure, protocol violation, authentication failure or
    /// handshake timeout; the connection is dropped in every case.
    #[allow(clippy::too_many_arguments)]
    pub async fn handshake(
        client_id: usize,
        mut stream: TcpStream,
        framebuffer: Framebuffer,
        tracker: Arc<UpdateTracker>,
        desktop_name: String,
        auth: &VncAuth,
        reverse_connection: bool,
        defer_update: Duration,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Result<(Self, bool)> {
        let host = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Updates are latency-sensitive; never wait for Nagle.
        stream.set_nodelay(true)?;

        stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;

        let mut version_buf = [0u8; 12];
        stream.read_exact(&mut version_buf).await?;
        let (major, minor) = parse_version(&version_buf)?;
        if major != 3 {
            let reason = format!("unsupported protocol major version {}", major);
            let mut msg = BytesMut::new();
            msg.put_u32(AUTH_CONN_FAILED);
            msg.put_u32(reason.len() as u32);
            msg.put_slice(reason.as_bytes());
            stream.write_all(&msg).await?;
            return Err(VncError::Protocol(reason));
        }
        if minor != 3 {
            info!("client {} speaks RFB 3.{}, continuing as 3.3", host, minor);
        }

        if auth.required() && !reverse_connection {
            let challenge = auth.generate_challenge();
            let mut msg = BytesMut::with_capacity(4 + CHALLENGE_SIZE);
            msg.put_u32(AUTH_VNC);
            msg.put_slice(&challenge);
            stream.write_all(&msg).await?;

            let mut response = [0u8; CHALLENGE_SIZE];
            tokio::time::timeout(AUTH_RESPONSE_TIMEOUT, stream.read_exact(&mut response))
                .await
                .map_err(|_| VncError::HandshakeTimeout)??;

            if !auth.verify_response(&response, &challenge) {
                let mut msg = BytesMut::with_capacity(4);
                msg.put_u32(AUTH_RESULT_FAILED);
                stream.write_all(&msg).await?;
                info!("client {} failed authentication", host);
                return Err(VncError::AuthenticationFailed);
            }
            let mut msg = BytesMut::with_capacity(4);
            msg.put_u32(AUTH_RESULT_OK);
            stream.write_all(&msg).await?;
        } else {
            let mut msg = BytesMut::with_capacity(4);
            msg.put_u32(AUTH_NONE);
            stream.write_all(&msg).await?;
        }

        let mut shared = [0u8; 1];
        stream.read_exact(&mut shared).await?;

        let server_init = ServerInit {
            framebuffer_width: framebuffer.width(),
            framebuffer_height: framebuffer.height(),
            pixel_format: framebuffer.format().clone(),
            name: desktop_name,
        };
        let mut init_buf = BytesMut::new();
        server_init.write_to(&mut init_buf);
        stream.write_all(&init_buf).await?;

        info!("client {} completed handshake", host);

        let colour_map = framebuffer.colour_map().await;
        let server_format = framebuffer.format().clone();
        let translator = Translator::new(&server_format, &server_format, Some(&colour_map))?;
        let needs_colour_map = translator.pending_palette().is_some();

        Ok((
            Self {
                stream,
                framebuffer,
                tracker,
                client_id,
                host,
                state: ClientState::Normal,
                reverse_connection,
                translator,
                needs_colour_map,
                preferred_encoding: ENCODING_RAW,
                enable_cursor_shape: false,
                use_rich_cursor: false,
                enable_last_rect: false,
                enable_pointer_pos: false,
                quality_level: -1,
                zlib_level: 5,
                zlib_stream: None,
                zrle_stream: None,
                tight_streams: TightStreams::new(),
                defer_update,
                defer_started: None,
                stats: ClientStats::default(),
                event_tx,
                control_rx,
            },
            shared[0] != 0,
        ))
    }

    /// The peer's address string.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the server dialed this connection.
    #[must_use]
    pub fn is_reverse_connection(&self) -> bool {
        self.reverse_connection
    }

    /// Accumulated transmission statistics.
    #[must_use]
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Runs the normal-phase message loop until the client disconnects.
    ///
    /// # Errors
    ///
    /// Protocol and I/O failures end the session; the caller logs them
    /// and tears the client down either way.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        let mut check_interval = tokio::time::interval(CHECK_INTERVAL);

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut buf) => {
                    if result? == 0 {
                        info!("client {} ({}) disconnected", self.client_id, self.host);
                        return Ok(());
                    }
                    while self.process_message(&mut buf).await? {}
                }
                _ = self.tracker.notify.notified() => {}
                _ = check_interval.tick() => {}
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(ControlMessage::CutText(text)) => self.send_cut_text(&text).await?,
                        Some(ControlMessage::Bell) => self.send_bell().await?,
                        Some(ControlMessage::Close) | None => {
                            info!("client {} ({}) closed by server", self.client_id, self.host);
                            return Ok(());
                        }
                    }
                }
            }

            self.maybe_send_update().await?;
        }
    }

    /// Parses one complete message out of `buf`.
    ///
    /// Returns `Ok(true)` when a message was consumed, `Ok(false)` when
    /// more bytes are needed.
    async fn process_message(&mut self, buf: &mut BytesMut) -> Result<bool> {
        if buf.is_empty() {
            return Ok(false);
        }

        match buf[0] {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                if buf.len() < 20 {
                    return Ok(false);
                }
                buf.advance(4); // tag + padding
                let requested = PixelFormat::from_bytes(buf)?;
                self.set_pixel_format(requested).await?;
            }
            CLIENT_MSG_FIX_COLOUR_MAP_ENTRIES => {
                error!("client {} sent FixColourMapEntries, closing", self.host);
                return Err(VncError::Protocol(
                    "FixColourMapEntries is not supported".to_string(),
                ));
            }
            CLIENT_MSG_SET_ENCODINGS => {
                if buf.len() < 4 {
                    return Ok(false);
                }
                let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if buf.len() < 4 + count * 4 {
                    return Ok(false);
                }
                buf.advance(4);
                let mut encodings = Vec::with_capacity(count);
                for _ in 0..count {
                    encodings.push(buf.get_i32());
                }
                self.set_encodings(&encodings).await;
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                if buf.len() < 10 {
                    return Ok(false);
                }
                buf.advance(1);
                let incremental = buf.get_u8() != 0;
                let x = buf.get_u16();
                let y = buf.get_u16();
                let width = buf.get_u16();
                let height = buf.get_u16();
                self.update_request(incremental, x, y, width, height).await;
            }
            CLIENT_MSG_KEY_EVENT => {
                if buf.len() < 8 {
                    return Ok(false);
                }
                buf.advance(1);
                let down = buf.get_u8() != 0;
                buf.advance(2);
                let key = buf.get_u32();
                self.stats.key_events += 1;
                let _ = self.event_tx.send(ClientEvent::KeyPress { down, key });
            }
            CLIENT_MSG_POINTER_EVENT => {
                if buf.len() < 6 {
                    return Ok(false);
                }
                buf.advance(1);
                let button_mask = buf.get_u8();
                let x = buf.get_u16();
                let y = buf.get_u16();
                self.stats.pointer_events += 1;
                let _ = self
                    .event_tx
                    .send(ClientEvent::PointerMove { x, y, button_mask });
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                if buf.len() < 8 {
                    return Ok(false);
                }
                let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                if length > MAX_CUT_TEXT {
                    error!("client {} sent {} bytes of cut text, closing", self.host, length);
                    return Err(VncError::Protocol("cut text too large".to_string()));
                }
                if buf.len() < 8 + length {
                    return Ok(false);
                }
                buf.advance(8);
                let text_bytes = buf.split_to(length);
                self.stats.cut_texts += 1;
                let text = String::from_utf8_lossy(&text_bytes).into_owned();
                let _ = self.event_tx.send(ClientEvent::CutText { text });
            }
            tag => {
                error!("client {} sent unknown message type {}, closing", self.host, tag);
                return Err(VncError::Protocol(format!("unknown message type {}", tag)));
            }
        }

        Ok(true)
    }

    /// Installs a new client pixel format and rebuilds the translator.
    async fn set_pixel_format(&mut self, requested: PixelFormat) -> Result<()> {
        if !requested.is_valid() {
            error!(
                "client {} requested invalid pixel format ({}bpp depth {}), closing",
                self.host, requested.bits_per_pixel, requested.depth
            );
            return Err(VncError::InvalidPixelFormat);
        }

        let server_format = self.framebuffer.format().clone();
        let colour_map = self.framebuffer.colour_map().await;
        let translator = match Translator::new(&server_format, &requested, Some(&colour_map)) {
            Ok(t) => t,
            Err(e) => {
                error!("client {}: unusable pixel format: {}", self.host, e);
                return Err(e);
            }
        };

        info!(
            "client {} set pixel format: {}bpp depth {} (translation {})",
            self.host,
            requested.bits_per_pixel,
            requested.depth,
            if server_format.equals(translator.client_format()) { "off" } else { "on" }
        );

        self.needs_colour_map = translator.pending_palette().is_some();
        self.translator = translator;
        Ok(())
    }

    /// Applies a SetEncodings list: preferred encoding, CopyRect
    /// capability, and the pseudo-encodings.
    async fn set_encodings(&mut self, encodings: &[i32]) {
        self.preferred_encoding = ENCODING_RAW;
        let mut preferred_chosen = false;
        let mut use_copy_rect = false;
        self.enable_cursor_shape = false;
        self.use_rich_cursor = false;
        self.enable_last_rect = false;
        self.enable_pointer_pos = false;

        for &enc in encodings {
            match enc {
                ENCODING_RAW | ENCODING_RRE | ENCODING_CORRE | ENCODING_HEXTILE
                | ENCODING_ZLIB | ENCODING_TIGHT | ENCODING_ZRLE => {
                    if !preferred_chosen {
                        self.preferred_encoding = enc;
                        preferred_chosen = true;
                    }
                }
                ENCODING_COPYRECT => use_copy_rect = true,
                ENCODING_ZLIBHEX => {
                    debug!("client {}: ZlibHex requested but not served", self.host);
                }
                ENCODING_XCURSOR => {
                    self.enable_cursor_shape = true;
                }
                ENCODING_RICH_CURSOR => {
                    self.enable_cursor_shape = true;
                    self.use_rich_cursor = true;
                }
                ENCODING_LAST_RECT => self.enable_last_rect = true,
                ENCODING_POINTER_POS => self.enable_pointer_pos = true,
                ENCODING_COMPRESS_LEVEL_0..=ENCODING_COMPRESS_LEVEL_9 => {
                    let level = (enc - ENCODING_COMPRESS_LEVEL_0) as u8;
                    if level != self.zlib_level {
                        self.zlib_level = level;
                        self.zlib_stream = None;
                        self.zrle_stream = None;
                    }
                    self.tight_streams.set_compress_level(level);
                }
                ENCODING_QUALITY_LEVEL_0..=ENCODING_QUALITY_LEVEL_9 => {
                    self.quality_level = (enc - ENCODING_QUALITY_LEVEL_0) as i8;
                }
                other => {
                    debug!("client {}: ignoring unknown encoding {}", self.host, other);
                }
            }
        }

        self.tracker
            .use_copy_rect
            .store(use_copy_rect, Ordering::Relaxed);

        // A client that just turned on cursor shapes needs the current
        // shape in its next update.
        if self.enable_cursor_shape && self.framebuffer.cursor_shape().await.is_some() {
            self.tracker.state.lock().await.cursor_changed = true;
        }

        info!(
            "client {}: preferred encoding {}, copyrect {}, cursor shapes {}, lastrect {}",
            self.host,
            crate::stats::encoding_name(self.preferred_encoding),
            use_copy_rect,
            self.enable_cursor_shape,
            self.enable_last_rect
        );
    }

    /// Handles a FramebufferUpdateRequest.
    async fn update_request(&mut self, incremental: bool, x: u16, y: u16, width: u16, height: u16) {
        let rect = Rect::from_xywh(i32::from(x), i32::from(y), i32::from(width), i32::from(height));
        let rect = match rect.intersect(&self.framebuffer.bounds()) {
            Some(r) => r,
            None => return,
        };

        debug!(
            "client {}: update request incremental={} {:?}",
            self.host, incremental, rect
        );

        let mut state = self.tracker.state.lock().await;
        state.requested.union_rect(rect);
        if !incremental {
            state.modified.union_rect(rect);
            state.copy.subtract_rect(&rect);
        }
    }

    /// Sends an update when something is pending and the deferral window
    /// has elapsed.
    async fn maybe_send_update(&mut self) -> Result<()> {
        if self.state != ClientState::Normal {
            return Ok(());
        }

        let pending = {
            let state = self.tracker.state.lock().await;
            let cursor_pending = (state.cursor_changed && self.enable_cursor_shape)
                || (state.cursor_moved && self.enable_pointer_pos);
            let mut payload = state.modified.clone();
            payload.union(&state.copy);
            payload.intersect(&state.requested);
            cursor_pending || !payload.is_empty()
        };

        if !pending {
            self.defer_started = None;
            return Ok(());
        }

        match self.defer_started {
            None => {
                self.defer_started = Some(Instant::now());
                Ok(())
            }
            Some(started) if started.elapsed() < self.defer_update => Ok(()),
            Some(_) => {
                self.defer_started = None;
                self.send_update().await
            }
        }
    }

    /// Composes and sends one FramebufferUpdate message.
    async fn send_update(&mut self) -> Result<()> {
        // Cursor bookkeeping happens before the tracker lock: shape-aware
        // clients must not see the software cursor in the pixels, everyone
        // else must.
        if self.enable_cursor_shape {
            if let Some(rect) = self.framebuffer.undraw_cursor().await {
                self.framebuffer
                    .mark_region_modified(&Region::from_rect(rect))
                    .await;
            }
        } else if let Some(rect) = self.framebuffer.draw_cursor().await {
            self.framebuffer
                .mark_region_modified(&Region::from_rect(rect))
                .await;
        }

        let cursor_shape = self.framebuffer.cursor_shape().await;
        let cursor_position = self.framebuffer.cursor_position().await;

        let (update_copy, update_raw, dx, dy, send_shape, send_position);
        {
            let mut state = self.tracker.state.lock().await;

            send_shape =
                self.enable_cursor_shape && state.cursor_changed && cursor_shape.is_some();
            send_position = self.enable_pointer_pos && state.cursor_moved;

            // A shape change is consumed even when the cursor was
            // removed; there is nothing to send for it.
            if self.enable_cursor_shape {
                state.cursor_changed = false;
            }
            if send_position {
                state.cursor_moved = false;
            }

            // Dirty destination pixels cannot be delivered as a copy.
            let modified = state.modified.clone();
            state.copy.subtract(&modified);

            let mut update_region = state.modified.clone();
            update_region.union(&state.copy);
            update_region.intersect(&state.requested);

            if update_region.is_empty() && !send_shape && !send_position {
                return Ok(());
            }

            // Both the source and the destination of a copy must lie in
            // what the client knows about.
            let mut copy_part = state.copy.clone();
            copy_part.intersect(&state.requested);
            let shifted_request = state.requested.translated(state.copy_dx, state.copy_dy);
            copy_part.intersect(&shifted_request);

            let mut raw_part = update_region.clone();
            raw_part.subtract(&copy_part);

            // Keep whatever is dirty but was not requested; the copy
            // region never carries over.
            let pending_copy = state.copy.clone();
            state.modified.union(&pending_copy);
            state.modified.subtract(&raw_part);
            state.modified.subtract(&copy_part);

            state.requested.clear();
            state.copy.clear();
            dx = state.copy_dx;
            dy = state.copy_dy;
            state.copy_dx = 0;
            state.copy_dy = 0;

            update_copy = copy_part;
            update_raw = raw_part;
        }

        let mut msg = BytesMut::new();

        if self.needs_colour_map {
            if let Some(palette) = self.translator.pending_palette() {
                palette.write_entries_msg(&mut msg);
            }
            self.needs_colour_map = false;
        }

        msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        msg.put_u8(0);
        let n_rects_pos = msg.len();
        msg.put_u16(0); // patched below

        let use_last_rect = self.enable_last_rect
            && self.preferred_encoding == ENCODING_TIGHT
            && !update_raw.is_empty();

        let mut n_rects: u16 = 0;

        if send_shape {
            if let Some(cursor) = &cursor_shape {
                let start = msg.len();
                cursor.write_shape_rect(
                    &mut msg,
                    self.translator.client_format(),
                    self.use_rich_cursor,
                );
                let enc = if self.use_rich_cursor { ENCODING_RICH_CURSOR } else { ENCODING_XCURSOR };
                self.stats.record_rect(enc, msg.len() - start);
                n_rects += 1;
            }
        }

        if send_position {
            Rectangle {
                x: cursor_position.0,
                y: cursor_position.1,
                width: 0,
                height: 0,
                encoding: ENCODING_POINTER_POS,
            }
            .write_header(&mut msg);
            self.stats.record_rect(ENCODING_POINTER_POS, 12);
            n_rects += 1;
        }

        // CopyRect first, ordered so no destination is written before a
        // later rectangle reads it as source.
        for rect in update_copy.rects_ordered(dx < 0, dy < 0) {
            Rectangle {
                x: rect.x1 as u16,
                y: rect.y1 as u16,
                width: rect.width() as u16,
                height: rect.height() as u16,
                encoding: ENCODING_COPYRECT,
            }
            .write_header(&mut msg);
            msg.put_u16((rect.x1 - dx) as u16);
            msg.put_u16((rect.y1 - dy) as u16);
            self.stats.record_rect(ENCODING_COPYRECT, 16);
            n_rects += 1;
        }

        for rect in update_raw.rects() {
            n_rects += self.encode_rect(&mut msg, rect).await?;
        }

        if use_last_rect {
            msg[n_rects_pos] = 0xFF;
            msg[n_rects_pos + 1] = 0xFF;
            Rectangle { x: 0, y: 0, width: 0, height: 0, encoding: ENCODING_LAST_RECT }
                .write_header(&mut msg);
            self.stats.record_rect(ENCODING_LAST_RECT, 12);
        } else {
            let count = n_rects.to_be_bytes();
            msg[n_rects_pos] = count[0];
            msg[n_rects_pos + 1] = count[1];
        }

        self.stream.write_all(&msg).await?;
        self.stats.updates_sent += 1;

        debug!(
            "client {}: sent update, {} rects, {} bytes",
            self.host,
            n_rects,
            msg.len()
        );
        Ok(())
    }

    /// Encodes one rectangle with the preferred encoding, returning the
    /// number of wire rectangles written.
    async fn encode_rect(&mut self, msg: &mut BytesMut, rect: &Rect) -> Result<u16> {
        let server_bytes = self.framebuffer.read_rect(rect).await;
        let stride = rect.width() as usize * self.framebuffer.format().bytes_per_pixel();
        let w = rect.width() as usize;
        let h = rect.height() as usize;

        let client_format = self.translator.client_format().clone();
        let raw_len = w * h * client_format.bytes_per_pixel();
        self.stats.record_raw_equivalent(12 + raw_len);

        match self.preferred_encoding {
            ENCODING_ZLIB => {
                let mut translated = BytesMut::new();
                self.translator
                    .translate_rect(&server_bytes, stride, w, h, &mut translated);
                let level = self.zlib_level;
                let stream = self
                    .zlib_stream
                    .get_or_insert_with(|| Compress::new(Compression::new(u32::from(level)), true));
                let payload = encode_zlib_persistent(&translated, stream)
                    .map_err(|e| VncError::Encoding(e.to_string()))?;
                self.write_rect(msg, rect, ENCODING_ZLIB, &payload);
                Ok(1)
            }
            ENCODING_ZRLE => {
                let words = self.translator.pixel_words(&server_bytes, stride, w, h);
                let level = self.zlib_level;
                let stream = self
                    .zrle_stream
                    .get_or_insert_with(|| Compress::new(Compression::new(u32::from(level)), true));
                let payload = encode_zrle_persistent(
                    &words,
                    &client_format,
                    rect.width() as u16,
                    rect.height() as u16,
                    stream,
                )
                .map_err(|e| VncError::Encoding(e.to_string()))?;
                self.write_rect(msg, rect, ENCODING_ZRLE, &payload);
                Ok(1)
            }
            ENCODING_TIGHT => {
                let words = self.translator.pixel_words(&server_bytes, stride, w, h);
                let subrects = encoding::tight::encode_rect(
                    &words,
                    &client_format,
                    rect.width() as u16,
                    rect.height() as u16,
                    self.quality_level,
                    &mut self.tight_streams,
                )
                .map_err(|e| VncError::Encoding(e.to_string()))?;

                let mut count = 0u16;
                for sub in subrects {
                    Rectangle {
                        x: rect.x1 as u16 + sub.x,
                        y: rect.y1 as u16 + sub.y,
                        width: sub.w,
                        height: sub.h,
                        encoding: ENCODING_TIGHT,
                    }
                    .write_header(msg);
                    msg.put_slice(&sub.data);
                    self.stats.record_rect(ENCODING_TIGHT, 12 + sub.data.len());
                    count += 1;
                }
                Ok(count)
            }
            ENCODING_RRE => {
                let words = self.translator.pixel_words(&server_bytes, stride, w, h);
                let payload = RreEncoding.encode(
                    &words,
                    &client_format,
                    rect.width() as u16,
                    rect.height() as u16,
                );
                if payload.len() >= raw_len {
                    // RRE lost; fall back to Raw for this rectangle.
                    let raw = RawEncoding.encode(
                        &words,
                        &client_format,
                        rect.width() as u16,
                        rect.height() as u16,
                    );
                    self.write_rect(msg, rect, ENCODING_RAW, &raw);
                } else {
                    self.write_rect(msg, rect, ENCODING_RRE, &payload);
                }
                Ok(1)
            }
            ENCODING_CORRE => {
                let words = self.translator.pixel_words(&server_bytes, stride, w, h);
                let mut count = 0u16;
                for ty in (0..h).step_by(CORRE_MAX_HEIGHT as usize) {
                    for tx in (0..w).step_by(CORRE_MAX_WIDTH as usize) {
                        let tw = (w - tx).min(CORRE_MAX_WIDTH as usize);
                        let th = (h - ty).min(CORRE_MAX_HEIGHT as usize);
                        let tile = encoding::common::extract_tile(&words, w, tx, ty, tw, th);
                        let tile_rect = Rect::new(
                            rect.x1 + tx as i32,
                            rect.y1 + ty as i32,
                            rect.x1 + (tx + tw) as i32,
                            rect.y1 + (ty + th) as i32,
                        );

                        let payload =
                            CorRreEncoding.encode(&tile, &client_format, tw as u16, th as u16);
                        let tile_raw_len = tw * th * client_format.bytes_per_pixel();
                        if payload.len() >= tile_raw_len {
                            let raw =
                                RawEncoding.encode(&tile, &client_format, tw as u16, th as u16);
                            self.write_rect(msg, &tile_rect, ENCODING_RAW, &raw);
                        } else {
                            self.write_rect(msg, &tile_rect, ENCODING_CORRE, &payload);
                        }
                        count += 1;
                    }
                }
                Ok(count)
            }
            ENCODING_HEXTILE => {
                let words = self.translator.pixel_words(&server_bytes, stride, w, h);
                let payload = HextileEncoding.encode(
                    &words,
                    &client_format,
                    rect.width() as u16,
                    rect.height() as u16,
                );
                self.write_rect(msg, rect, ENCODING_HEXTILE, &payload);
                Ok(1)
            }
            _ => {
                let mut translated = BytesMut::new();
                self.translator
                    .translate_rect(&server_bytes, stride, w, h, &mut translated);
                self.write_rect(msg, rect, ENCODING_RAW, &translated);
                Ok(1)
            }
        }
    }

    fn write_rect(&mut self, msg: &mut BytesMut, rect: &Rect, encoding: i32, payload: &[u8]) {
        Rectangle {
            x: rect.x1 as u16,
            y: rect.y1 as u16,
            width: rect.width() as u16,
            height: rect.height() as u16,
            encoding,
        }
        .write_header(msg);
        msg.put_slice(payload);
        self.stats.record_rect(encoding, 12 + payload.len());
    }

    /// Sends a ServerCutText message.
    async fn send_cut_text(&mut self, text: &str) -> Result<()> {
        let mut msg = BytesMut::new();
        msg.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        msg.put_bytes(0, 3);
        msg.put_u32(text.len() as u32);
        msg.put_slice(text.as_bytes());
        self.stream.write_all(&msg).await?;
        Ok(())
    }

    /// Sends a Bell message.
    async fn send_bell(&mut self) -> Result<()> {
        self.stream.write_all(&[SERVER_MSG_BELL]).await?;
        Ok(())
    }
}

/// Parses a 12-byte `RFB xxx.yyy\n` banner.
fn parse_version(banner: &[u8; 12]) -> Result<(u32, u32)> {
    fn digits(bytes: &[u8]) -> Option<u32> {
        bytes.iter().try_fold(0u32, |acc, &b| {
            b.is_ascii_digit().then(|| acc * 10 + u32::from(b - b'0'))
        })
    }

    if &banner[0..4] != b"RFB " || banner[7] != b'.' || banner[11] != b'\n' {
        return Err(VncError::Protocol(format!(
            "malformed version banner {:?}",
            String::from_utf8_lossy(banner)
        )));
    }
    match (digits(&banner[4..7]), digits(&banner[8..11])) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(VncError::Protocol("malformed version banner".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_banner_parsing() {
        assert_eq!(parse_version(b"RFB 003.003\n").unwrap(), (3, 3));
        assert_eq!(parse_version(b"RFB 003.008\n").unwrap(), (3, 8));
        assert!(parse_version(b"HTTP/1.1 200").is_err());
    }
}
