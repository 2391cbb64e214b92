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

//! The server handle: listener, client registry and embedding interface.
//!
//! A [`VncServer`] is a cheap clone wrapping shared state. The host
//! application paints into the framebuffer through it, and receives
//! input as [`ServerEvent`] values from the events channel. Each
//! accepted connection runs in its own task; the server keeps only a
//! control channel per client, so one slow or dead viewer never stalls
//! the others.

use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::auth::VncAuth;
use crate::client::{ClientEvent, ControlMessage, VncClient};
use crate::cursor::Cursor;
use crate::error::Result;
use crate::events::{NewClientAction, ServerEvent};
use crate::framebuffer::{Framebuffer, UpdateTracker};
use crate::protocol::{ColourMap, PixelFormat};
use crate::region::Region;

/// Default update-deferral window, the classic 40 ms.
const DEFAULT_DEFER_UPDATE: Duration = Duration::from_millis(40);

/// How exclusive-access requests in ClientInit are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharePolicy {
    /// Honour the client's flag; an exclusive newcomer disconnects the
    /// established clients.
    FollowClient,
    /// Honour the client's flag, but refuse an exclusive newcomer
    /// instead of disconnecting anyone.
    FollowClientDontDisconnect,
    /// Treat every client as shared.
    AlwaysShared,
    /// Treat every client as exclusive.
    NeverShared,
}

/// Synchronous accept/refuse decision for incoming connections.
pub type NewClientHook = Box<dyn Fn(usize, SocketAddr) -> NewClientAction + Send + Sync>;

struct ClientHandle {
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    #[allow(dead_code)]
    address: SocketAddr,
}

struct ServerInner {
    framebuffer: Framebuffer,
    desktop_name: RwLock<String>,
    password: RwLock<Option<String>>,
    policy: RwLock<SharePolicy>,
    defer_update: RwLock<Duration>,
    clients: RwLock<HashMap<usize, ClientHandle>>,
    next_client_id: AtomicUsize,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    pointer_owner: Mutex<Option<usize>>,
    new_client_hook: std::sync::RwLock<Option<NewClientHook>>,
}

/// A VNC server exporting one framebuffer. Clones share all state.
#[derive(Clone)]
pub struct VncServer {
    inner: Arc<ServerInner>,
}

impl VncServer {
    /// Creates a server with a 32-bit true-colour framebuffer.
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self::with_format(width, height, PixelFormat::rgb32())
            .expect("rgb32 is a supported framebuffer format")
    }

    /// Creates a server with an explicit 8/16/32bpp server format.
    ///
    /// # Errors
    ///
    /// Fails when the format's depth is unsupported.
    pub fn with_format(width: u16, height: u16, format: PixelFormat) -> Result<Self> {
        let framebuffer = Framebuffer::new(width, height, format)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(ServerInner {
                framebuffer,
                desktop_name: RwLock::new("rfbserver".to_string()),
                password: RwLock::new(None),
                policy: RwLock::new(SharePolicy::FollowClient),
                defer_update: RwLock::new(DEFAULT_DEFER_UPDATE),
                clients: RwLock::new(HashMap::new()),
                next_client_id: AtomicUsize::new(1),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                pointer_owner: Mutex::new(None),
                new_client_hook: std::sync::RwLock::new(None),
            }),
        })
    }

    /// The shared framebuffer handle.
    #[must_use]
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.inner.framebuffer
    }

    /// Takes the event receiver. Yields `None` after the first call.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.inner.event_rx.lock().await.take()
    }

    /// Sets or clears the VNC password.
    pub async fn set_password(&self, password: Option<String>) {
        *self.inner.password.write().await = password;
    }

    /// Loads the password from an 8-byte obfuscated password file.
    ///
    /// # Errors
    ///
    /// Propagates read failures and malformed files.
    pub async fn load_password_file(&self, path: &Path) -> std::io::Result<()> {
        let password = crate::auth::load_password_file(path)?;
        self.set_password(Some(password)).await;
        Ok(())
    }

    /// Sets the desktop name announced in ServerInit.
    pub async fn set_desktop_name(&self, name: &str) {
        *self.inner.desktop_name.write().await = name.to_string();
    }

    /// Sets the update-coalescing window in milliseconds.
    pub async fn set_defer_update_ms(&self, ms: u64) {
        *self.inner.defer_update.write().await = Duration::from_millis(ms);
    }

    /// Sets the shared-session policy.
    pub async fn set_share_policy(&self, policy: SharePolicy) {
        *self.inner.policy.write().await = policy;
    }

    /// Installs the accept/refuse hook for new connections.
    pub fn set_new_client_hook(&self, hook: NewClientHook) {
        *self.inner.new_client_hook.write().expect("hook lock poisoned") = Some(hook);
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    /// Accepts connections on `0.0.0.0:port` until the task is dropped.
    ///
    /// # Errors
    ///
    /// Fails when the listener cannot be bound; per-connection errors
    /// are logged and do not stop the loop.
    pub async fn listen(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("listening for VNC connections on port {}", port);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, false).await;
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
    }

    /// Adopts an already-connected stream as a client (inetd style) and
    /// serves it to completion.
    pub async fn serve_stream(&self, stream: TcpStream) {
        self.handle_connection(stream, false).await;
    }

    /// Dials out to a listening viewer. Authentication is skipped on
    /// reverse connections.
    ///
    /// # Errors
    ///
    /// Fails when the connection cannot be established.
    pub async fn connect_reverse<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let server = self.clone();
        tokio::spawn(async move {
            server.handle_connection(stream, true).await;
        });
        Ok(())
    }

    /// Writes pixels (server format, packed rows) and marks them dirty.
    pub async fn update_framebuffer(&self, data: &[u8], x: u16, y: u16, w: u16, h: u16) {
        self.inner.framebuffer.write_pixels(data, x, y, w, h).await;
    }

    /// Reports a framebuffer change; see
    /// [`Framebuffer::mark_rect_modified`].
    pub async fn mark_rect_modified(&self, x1: i32, y1: i32, x2: i32, y2: i32) {
        self.inner.framebuffer.mark_rect_modified(x1, y1, x2, y2).await;
    }

    /// Reports framebuffer changes as a region.
    pub async fn mark_region_modified(&self, region: &Region) {
        self.inner.framebuffer.mark_region_modified(region).await;
    }

    /// Schedules a copy of already-moved pixels; see
    /// [`Framebuffer::schedule_copy_region`].
    pub async fn schedule_copy_region(&self, region: &Region, dx: i32, dy: i32) {
        self.inner.framebuffer.schedule_copy_region(region, dx, dy).await;
    }

    /// Schedules a copy of one source rectangle.
    pub async fn schedule_copy_rect(&self, x1: i32, y1: i32, x2: i32, y2: i32, dx: i32, dy: i32) {
        self.inner
            .framebuffer
            .schedule_copy_rect(x1, y1, x2, y2, dx, dy)
            .await;
    }

    /// Moves pixels on the server framebuffer and schedules the copy.
    pub async fn do_copy_region(&self, region: &Region, dx: i32, dy: i32) {
        self.inner.framebuffer.do_copy_region(region, dx, dy).await;
    }

    /// Moves one rectangle on the server framebuffer and schedules it.
    pub async fn do_copy_rect(&self, x1: i32, y1: i32, x2: i32, y2: i32, dx: i32, dy: i32) {
        self.inner.framebuffer.do_copy_rect(x1, y1, x2, y2, dx, dy).await;
    }

    /// Installs or removes the cursor shape.
    pub async fn set_cursor(&self, cursor: Option<Cursor>) {
        self.inner.framebuffer.set_cursor(cursor).await;
    }

    /// Replaces the server colour map (colour-mapped formats only).
    pub async fn set_colour_map(&self, map: ColourMap) {
        self.inner.framebuffer.set_colour_map(map).await;
    }

    /// Sends clipboard text to every client.
    pub async fn send_cut_text(&self, text: &str) {
        self.broadcast(|| ControlMessage::CutText(text.to_string())).await;
    }

    /// Rings the bell on every client.
    pub async fn bell(&self) {
        self.broadcast(|| ControlMessage::Bell).await;
    }

    /// Disconnects one client.
    pub async fn disconnect_client(&self, id: usize) {
        let clients = self.inner.clients.read().await;
        if let Some(handle) = clients.get(&id) {
            let _ = handle.control_tx.send(ControlMessage::Close);
        }
    }

    async fn broadcast(&self, make: impl Fn() -> ControlMessage) {
        let clients = self.inner.clients.read().await;
        for handle in clients.values() {
            let _ = handle.control_tx.send(make());
        }
    }

    /// Drives one connection from handshake to teardown.
    async fn handle_connection(&self, stream: TcpStream, reverse: bool) {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let address = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("client {}: no peer address: {}", client_id, e);
                return;
            }
        };

        {
            let hook = self.inner.new_client_hook.read().expect("hook lock poisoned");
            if let Some(hook) = hook.as_ref() {
                if hook(client_id, address) == NewClientAction::Refuse {
                    info!("client {} ({}) refused by hook", client_id, address);
                    return;
                }
            }
        }

        let auth = VncAuth::new(self.inner.password.read().await.clone());
        let desktop_name = self.inner.desktop_name.read().await.clone();
        let defer_update = *self.inner.defer_update.read().await;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(UpdateTracker::new(client_id));

        let outcome = VncClient::handshake(
            client_id,
            stream,
            self.inner.framebuffer.clone(),
            tracker.clone(),
            desktop_name,
            &auth,
            reverse,
            defer_update,
            event_tx,
            control_rx,
        )
        .await;

        let (mut client, shared) = match outcome {
            Ok(v) => v,
            Err(e) => {
                info!("client {} ({}) handshake failed: {}", client_id, address, e);
                return;
            }
        };

        if !self.apply_share_policy(client_id, shared).await {
            info!("client {} ({}) refused: session is exclusive", client_id, address);
            return;
        }

        self.inner.framebuffer.register_tracker(tracker.clone()).await;
        self.inner.clients.write().await.insert(
            client_id,
            ClientHandle { control_tx, address },
        );
        info!(
            "client {} ({}) ready{}",
            client_id,
            address,
            if client.is_reverse_connection() { " (reverse connection)" } else { "" }
        );
        let _ = self
            .inner
            .event_tx
            .send(ServerEvent::ClientConnected { id: client_id, address });

        // Input events are forwarded concurrently with the client task so
        // pointer ownership and cursor movement apply even while the
        // client task is busy encoding.
        let forwarder = tokio::spawn(forward_events(self.clone(), client_id, event_rx));

        if let Err(e) = client.run().await {
            info!("client {} ({}): {}", client_id, address, e);
        }
        client.stats().log_summary(client.host());
        drop(client);

        forwarder.abort();
        self.inner.framebuffer.unregister_tracker(client_id).await;
        self.inner.clients.write().await.remove(&client_id);
        {
            let mut owner = self.inner.pointer_owner.lock().await;
            if *owner == Some(client_id) {
                *owner = None;
            }
        }
        let _ = self
            .inner
            .event_tx
            .send(ServerEvent::ClientDisconnected { id: client_id });
        info!("client {} ({}) cleaned up", client_id, address);
    }

    /// Applies the share policy for a freshly handshaken client.
    ///
    /// Returns false when this client must be refused.
    async fn apply_share_policy(&self, client_id: usize, client_shared: bool) -> bool {
        let policy = *self.inner.policy.read().await;
        let shared = match policy {
            SharePolicy::AlwaysShared => true,
            SharePolicy::NeverShared => false,
            SharePolicy::FollowClient | SharePolicy::FollowClientDontDisconnect => client_shared,
        };
        if shared {
            return true;
        }

        let clients = self.inner.clients.read().await;
        if clients.is_empty() {
            return true;
        }
        if policy == SharePolicy::FollowClientDontDisconnect {
            return false;
        }
        info!(
            "client {} wants exclusive access, disconnecting {} other client(s)",
            client_id,
            clients.len()
        );
        for handle in clients.values() {
            let _ = handle.control_tx.send(ControlMessage::Close);
        }
        true
    }
}

/// Maps raw client events to [`ServerEvent`]s, enforcing single-owner
/// pointer semantics and moving the software cursor.
async fn forward_events(
    server: VncServer,
    client_id: usize,
    mut event_rx: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            ClientEvent::KeyPress { down, key } => {
                let _ = server.inner.event_tx.send(ServerEvent::KeyEvent {
                    client_id,
                    key,
                    pressed: down,
                });
            }
            ClientEvent::PointerMove { x, y, button_mask } => {
                {
                    let mut owner = server.inner.pointer_owner.lock().await;
                    match *owner {
                        Some(id) if id != client_id => continue,
                        _ => {}
                    }
                    *owner = if button_mask != 0 { Some(client_id) } else { None };
                }
                server.inner.framebuffer.set_cursor_position(x, y).await;
                let _ = server.inner.event_tx.send(ServerEvent::PointerEvent {
                    client_id,
                    x,
                    y,
                    button_mask,
                });
            }
            ClientEvent::CutText { text } => {
                let _ = server
                    .inner
                    .event_tx
                    .send(ServerEvent::ClipboardReceived { client_id, text });
            }
        }
    }
    // Channel closed: the client task is gone; teardown happens there.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_receiver_is_taken_once() {
        let server = VncServer::new(16, 16);
        assert!(server.events().await.is_some());
        assert!(server.events().await.is_none());
    }

    #[tokio::test]
    async fn settings_apply() {
        let server = VncServer::new(16, 16);
        server.set_password(Some("secret".to_string())).await;
        server.set_desktop_name("desk").await;
        server.set_defer_update_ms(5).await;
        server.set_share_policy(SharePolicy::AlwaysShared).await;
        assert_eq!(server.client_count().await, 0);
        assert_eq!(*server.inner.desktop_name.read().await, "desk");
        assert_eq!(*server.inner.policy.read().await, SharePolicy::AlwaysShared);
    }
}
