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

//! The shared framebuffer and per-client dirty-region fan-out.
//!
//! A [`Framebuffer`] is a cheaply clonable handle to the pixel store that
//! one producer paints into and every client reads from. Producers report
//! changes through [`Framebuffer::mark_rect_modified`] and friends; the
//! framebuffer unions the affected region into every registered client's
//! [`UpdateTracker`] and wakes its task. Clients never learn about pixels
//! that were painted but not marked.
//!
//! The framebuffer also hosts the software cursor engine: for clients
//! that did not negotiate cursor-shape updates the cursor is painted into
//! the pixel store before their updates are composed, with the covered
//! pixels saved aside and restored on undraw.

use crate::cursor::Cursor;
use crate::error::{Result, VncError};
use crate::protocol::{ColourMap, PixelFormat};
use crate::region::{Rect, Region};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

/// Per-client pending-update state, shared between the framebuffer (which
/// feeds it) and the client task (which drains it).
#[derive(Debug, Default)]
pub struct TrackerState {
    /// Pixels changed since the client last saw them.
    pub modified: Region,
    /// Destination pixels obtainable by copying from `(x - dx, y - dy)`.
    pub copy: Region,
    /// Horizontal component of the single pending copy vector.
    pub copy_dx: i32,
    /// Vertical component of the single pending copy vector.
    pub copy_dy: i32,
    /// Union of outstanding FramebufferUpdateRequest rectangles.
    pub requested: Region,
    /// The cursor shape changed since the last shape update.
    pub cursor_changed: bool,
    /// The pointer moved since the last position update.
    pub cursor_moved: bool,
}

/// The dirty-tracking channel between the framebuffer and one client.
#[derive(Debug)]
pub struct UpdateTracker {
    /// Pending-update state, guarded by its own lock.
    pub state: Mutex<TrackerState>,
    /// Wakes the client task when pending state appears.
    pub notify: Notify,
    /// Whether the client accepts CopyRect; copies degrade to plain
    /// modifications when it does not.
    pub use_copy_rect: AtomicBool,
    id: usize,
}

impl UpdateTracker {
    /// Creates an empty tracker for the client with the given id.
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            notify: Notify::new(),
            use_copy_rect: AtomicBool::new(false),
            id,
        }
    }

    /// The owning client's id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

struct CursorState {
    cursor: Option<Cursor>,
    x: u16,
    y: u16,
    drawn: bool,
    saved: Vec<u8>,
    saved_rect: Rect,
}

struct FbInner {
    width: u16,
    height: u16,
    format: PixelFormat,
    bytes_per_row: usize,
    pixels: RwLock<Vec<u8>>,
    colour_map: RwLock<ColourMap>,
    cursor: Mutex<CursorState>,
    trackers: RwLock<Vec<Arc<UpdateTracker>>>,
}

/// Handle to the shared framebuffer. Clones refer to the same pixels.
#[derive(Clone)]
pub struct Framebuffer {
    inner: Arc<FbInner>,
}

impl Framebuffer {
    /// Creates a framebuffer of the given size and server pixel format,
    /// initially all zero.
    ///
    /// # Errors
    ///
    /// Fails if the format is not an 8, 16 or 32 bits-per-pixel format.
    pub fn new(width: u16, height: u16, format: PixelFormat) -> Result<Self> {
        if format.bits_per_pixel != 8 && format.bits_per_pixel != 16 && format.bits_per_pixel != 32
        {
            return Err(VncError::InvalidPixelFormat);
        }
        let bytes_per_row = usize::from(width) * format.bytes_per_pixel();
        let pixels = vec![0u8; bytes_per_row * usize::from(height)];
        Ok(Self {
            inner: Arc::new(FbInner {
                width,
                height,
                format,
                bytes_per_row,
                pixels: RwLock::new(pixels),
                colour_map: RwLock::new(ColourMap::default()),
                cursor: Mutex::new(CursorState {
                    cursor: None,
                    x: 0,
                    y: 0,
                    drawn: false,
                    saved: Vec::new(),
                    saved_rect: Rect::new(0, 0, 0, 0),
                }),
                trackers: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Framebuffer width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.inner.width
    }

    /// Framebuffer height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.inner.height
    }

    /// The server's native pixel format.
    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        &self.inner.format
    }

    /// Bytes per framebuffer row.
    #[must_use]
    pub fn bytes_per_row(&self) -> usize {
        self.inner.bytes_per_row
    }

    /// The rectangle covering the whole framebuffer.
    #[must_use]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, i32::from(self.inner.width), i32::from(self.inner.height))
    }

    /// Replaces the server colour map (colour-mapped formats only).
    pub async fn set_colour_map(&self, map: ColourMap) {
        *self.inner.colour_map.write().await = map;
    }

    /// A snapshot of the server colour map.
    pub async fn colour_map(&self) -> ColourMap {
        self.inner.colour_map.read().await.clone()
    }

    /// Registers a client's tracker so it receives dirty-region pushes.
    pub async fn register_tracker(&self, tracker: Arc<UpdateTracker>) {
        self.inner.trackers.write().await.push(tracker);
    }

    /// Removes a client's tracker.
    pub async fn unregister_tracker(&self, id: usize) {
        self.inner.trackers.write().await.retain(|t| t.id() != id);
    }

    /// Reads a rectangle of server-format pixels into packed rows.
    ///
    /// The rectangle must lie within the framebuffer bounds.
    pub async fn read_rect(&self, rect: &Rect) -> Vec<u8> {
        let bpp = self.inner.format.bytes_per_pixel();
        let w = rect.width() as usize;
        let h = rect.height() as usize;
        let mut out = Vec::with_capacity(w * h * bpp);
        let pixels = self.inner.pixels.read().await;
        for y in 0..h {
            let start =
                (rect.y1 as usize + y) * self.inner.bytes_per_row + rect.x1 as usize * bpp;
            out.extend_from_slice(&pixels[start..start + w * bpp]);
        }
        out
    }

    /// Writes pixels into the framebuffer and marks the area modified.
    ///
    /// `data` must hold `w * h` pixels in server format, packed rows.
    pub async fn write_pixels(&self, data: &[u8], x: u16, y: u16, w: u16, h: u16) {
        self.undraw_cursor().await;

        let bpp = self.inner.format.bytes_per_pixel();
        let row_len = usize::from(w) * bpp;
        {
            let mut pixels = self.inner.pixels.write().await;
            for row in 0..usize::from(h) {
                let src = &data[row * row_len..(row + 1) * row_len];
                let dst = (usize::from(y) + row) * self.inner.bytes_per_row + usize::from(x) * bpp;
                pixels[dst..dst + row_len].copy_from_slice(src);
            }
        }

        let rect = Rect::from_xywh(i32::from(x), i32::from(y), i32::from(w), i32::from(h));
        self.mark_region_modified(&Region::from_rect(rect)).await;
    }

    /// Marks a rectangle modified, given loose corner coordinates.
    ///
    /// Coordinates may arrive swapped; the second corner is inclusive.
    /// The result is clamped to the framebuffer.
    pub async fn mark_rect_modified(&self, x1: i32, y1: i32, x2: i32, y2: i32) {
        let (mut x1, mut x2) = if x1 > x2 { (x2, x1) } else { (x1, x2) };
        let (mut y1, mut y2) = if y1 > y2 { (y2, y1) } else { (y1, y2) };
        x2 += 1;
        y2 += 1;
        x1 = x1.max(0);
        y1 = y1.max(0);
        x2 = x2.min(i32::from(self.inner.width));
        y2 = y2.min(i32::from(self.inner.height));
        if x1 >= x2 || y1 >= y2 {
            return;
        }
        self.mark_region_modified(&Region::from_rect(Rect::new(x1, y1, x2, y2)))
            .await;
    }

    /// Unions a region into every client's modified region and wakes them.
    pub async fn mark_region_modified(&self, region: &Region) {
        if region.is_empty() {
            return;
        }
        let trackers = self.inner.trackers.read().await;
        for tracker in trackers.iter() {
            let mut state = tracker.state.lock().await;
            state.modified.union(region);
            drop(state);
            tracker.notify.notify_one();
        }
    }

    /// Schedules a copy: the pixels of `region` moved by `(dx, dy)`.
    ///
    /// `region` names the *source* pixels; the destination is the region
    /// translated by the vector, clipped to the framebuffer. Trackers
    /// store destinations, so a destination pixel `(x, y)` reads from
    /// `(x - dx, y - dy)`.
    ///
    /// Only one copy vector is tracked per client. If a copy with a
    /// different vector is already pending, the pending destinations are
    /// downgraded to plain modifications first. Clients that rejected
    /// CopyRect get plain modifications directly.
    pub async fn schedule_copy_region(&self, region: &Region, dx: i32, dy: i32) {
        let mut region = region.translated(dx, dy);
        region.intersect_rect(&self.bounds());
        let region = &region;
        if region.is_empty() {
            return;
        }
        let trackers = self.inner.trackers.read().await;
        for tracker in trackers.iter() {
            let mut state = tracker.state.lock().await;
            if tracker.use_copy_rect.load(Ordering::Relaxed) {
                if !state.copy.is_empty() && (state.copy_dx != dx || state.copy_dy != dy) {
                    let pending = std::mem::take(&mut state.copy);
                    state.modified.union(&pending);
                }
                state.copy.union(region);
                state.copy_dx = dx;
                state.copy_dy = dy;
            } else {
                state.modified.union(region);
            }
            drop(state);
            tracker.notify.notify_one();
        }
    }

    /// [`Framebuffer::schedule_copy_region`] for a single source
    /// rectangle given as corner coordinates (exclusive lower-right).
    pub async fn schedule_copy_rect(&self, x1: i32, y1: i32, x2: i32, y2: i32, dx: i32, dy: i32) {
        let region = Region::from_rect(Rect::new(x1, y1, x2, y2));
        self.schedule_copy_region(&region, dx, dy).await;
    }

    /// Performs the copy on the server framebuffer, then schedules it.
    ///
    /// `region` names the source pixels, as in
    /// [`Framebuffer::schedule_copy_region`]. Rows move in an order that
    /// never overwrites unread source pixels.
    pub async fn do_copy_region(&self, region: &Region, dx: i32, dy: i32) {
        let mut dest = region.translated(dx, dy);
        dest.intersect_rect(&self.bounds());
        if dest.is_empty() {
            return;
        }
        self.undraw_cursor().await;

        let bpp = self.inner.format.bytes_per_pixel();
        let stride = self.inner.bytes_per_row;
        {
            let mut pixels = self.inner.pixels.write().await;
            for rect in dest.rects_ordered(dx < 0, dy < 0) {
                let width_bytes = rect.width() as usize * bpp;
                let rows: Vec<i32> = if dy < 0 {
                    (rect.y1..rect.y2).collect()
                } else {
                    (rect.y1..rect.y2).rev().collect()
                };
                for y in rows {
                    let dst = y as usize * stride + rect.x1 as usize * bpp;
                    let src = (y - dy) as usize * stride + (rect.x1 - dx) as usize * bpp;
                    pixels.copy_within(src..src + width_bytes, dst);
                }
            }
        }

        self.schedule_copy_region(region, dx, dy).await;
    }

    /// [`Framebuffer::do_copy_region`] for a single rectangle.
    pub async fn do_copy_rect(&self, x1: i32, y1: i32, x2: i32, y2: i32, dx: i32, dy: i32) {
        let region = Region::from_rect(Rect::new(x1, y1, x2, y2));
        self.do_copy_region(&region, dx, dy).await;
    }

    /// Installs (or clears) the cursor shape.
    ///
    /// Shape-capable clients are flagged for a cursor pseudo-rectangle;
    /// the shape's on-screen area is marked modified so everyone else
    /// repaints it.
    pub async fn set_cursor(&self, cursor: Option<Cursor>) {
        self.undraw_cursor().await;

        let old_rect;
        let new_rect;
        {
            let mut state = self.inner.cursor.lock().await;
            old_rect = cursor_rect(&state, self.inner.width, self.inner.height);
            state.cursor = cursor;
            new_rect = cursor_rect(&state, self.inner.width, self.inner.height);
        }

        let trackers = self.inner.trackers.read().await;
        for tracker in trackers.iter() {
            let mut st = tracker.state.lock().await;
            st.cursor_changed = true;
            drop(st);
            tracker.notify.notify_one();
        }
        drop(trackers);

        let mut region = Region::new();
        if let Some(r) = old_rect {
            region.union_rect(r);
        }
        if let Some(r) = new_rect {
            region.union_rect(r);
        }
        self.mark_region_modified(&region).await;
    }

    /// Moves the pointer hot spot.
    ///
    /// The cursor is undrawn first; clients that track the pointer
    /// position are flagged, and the old and new shape areas are marked
    /// modified so software-cursor clients repaint.
    pub async fn set_cursor_position(&self, x: u16, y: u16) {
        self.undraw_cursor().await;

        let mut region = Region::new();
        {
            let mut state = self.inner.cursor.lock().await;
            if state.x == x && state.y == y {
                return;
            }
            if let Some(r) = cursor_rect(&state, self.inner.width, self.inner.height) {
                region.union_rect(r);
            }
            state.x = x;
            state.y = y;
            if let Some(r) = cursor_rect(&state, self.inner.width, self.inner.height) {
                region.union_rect(r);
            }
        }

        let trackers = self.inner.trackers.read().await;
        for tracker in trackers.iter() {
            let mut st = tracker.state.lock().await;
            st.cursor_moved = true;
            drop(st);
            tracker.notify.notify_one();
        }
        drop(trackers);

        self.mark_region_modified(&region).await;
    }

    /// The current pointer position.
    pub async fn cursor_position(&self) -> (u16, u16) {
        let state = self.inner.cursor.lock().await;
        (state.x, state.y)
    }

    /// A copy of the current cursor shape.
    pub async fn cursor_shape(&self) -> Option<Cursor> {
        self.inner.cursor.lock().await.cursor.clone()
    }

    /// Paints the cursor into the framebuffer, saving the pixels under it.
    ///
    /// No-op when already drawn or when no cursor is installed. Returns
    /// the affected rectangle when pixels changed.
    pub async fn draw_cursor(&self) -> Option<Rect> {
        let mut state = self.inner.cursor.lock().await;
        if state.drawn {
            return None;
        }
        let rect = cursor_rect(&state, self.inner.width, self.inner.height)?;
        let cursor = state.cursor.clone()?;

        let bpp = self.inner.format.bytes_per_pixel();
        let stride = self.inner.bytes_per_row;
        let origin_x = i32::from(state.x) - i32::from(cursor.hot_x);
        let origin_y = i32::from(state.y) - i32::from(cursor.hot_y);

        let mut pixels = self.inner.pixels.write().await;

        // Save everything under the clipped shape, then overlay the
        // opaque cursor pixels.
        let mut saved = Vec::with_capacity(rect.width() as usize * rect.height() as usize * bpp);
        for y in rect.y1..rect.y2 {
            let start = y as usize * stride + rect.x1 as usize * bpp;
            saved.extend_from_slice(&pixels[start..start + rect.width() as usize * bpp]);
        }

        let mut scratch = bytes::BytesMut::with_capacity(4);
        for y in rect.y1..rect.y2 {
            for x in rect.x1..rect.x2 {
                let cx = (x - origin_x) as usize;
                let cy = (y - origin_y) as usize;
                if !cursor.mask_bit(cx, cy) {
                    continue;
                }
                let (r, g, b) = cursor.pixel_rgb(cx, cy);
                let pixel = self.inner.format.rgb_to_pixel(r, g, b);
                scratch.clear();
                self.inner.format.write_pixel(&mut scratch, pixel);
                let dst = y as usize * stride + x as usize * bpp;
                pixels[dst..dst + bpp].copy_from_slice(&scratch[..bpp]);
            }
        }
        drop(pixels);

        state.saved = saved;
        state.saved_rect = rect;
        state.drawn = true;
        debug!("cursor drawn at {:?}", rect);
        Some(rect)
    }

    /// Restores the pixels saved by [`Framebuffer::draw_cursor`].
    ///
    /// Returns the restored rectangle when the cursor was drawn.
    pub async fn undraw_cursor(&self) -> Option<Rect> {
        let mut state = self.inner.cursor.lock().await;
        if !state.drawn {
            return None;
        }
        let rect = state.saved_rect;
        let bpp = self.inner.format.bytes_per_pixel();
        let stride = self.inner.bytes_per_row;

        let mut pixels = self.inner.pixels.write().await;
        let row_len = rect.width() as usize * bpp;
        for (i, y) in (rect.y1..rect.y2).enumerate() {
            let dst = y as usize * stride + rect.x1 as usize * bpp;
            pixels[dst..dst + row_len].copy_from_slice(&state.saved[i * row_len..(i + 1) * row_len]);
        }
        drop(pixels);

        state.drawn = false;
        state.saved.clear();
        Some(rect)
    }

    /// Whether the software cursor is currently painted in.
    pub async fn cursor_is_drawn(&self) -> bool {
        self.inner.cursor.lock().await.drawn
    }
}

/// The on-screen rectangle of the cursor shape clipped to the
/// framebuffer, if any of it is visible.
fn cursor_rect(state: &CursorState, width: u16, height: u16) -> Option<Rect> {
    let cursor = state.cursor.as_ref()?;
    let x = i32::from(state.x) - i32::from(cursor.hot_x);
    let y = i32::from(state.y) - i32::from(cursor.hot_y);
    let rect = Rect::from_xywh(x, y, i32::from(cursor.width), i32::from(cursor.height));
    rect.intersect(&Rect::new(0, 0, i32::from(width), i32::from(height)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fb_4x3() -> Framebuffer {
        Framebuffer::new(4, 3, PixelFormat::rgb32()).unwrap()
    }

    #[tokio::test]
    async fn write_pixels_marks_modified() {
        let fb = fb_4x3();
        let tracker = Arc::new(UpdateTracker::new(1));
        fb.register_tracker(tracker.clone()).await;

        let data = vec![0xABu8; 2 * 1 * 4];
        fb.write_pixels(&data, 1, 1, 2, 1).await;

        let state = tracker.state.lock().await;
        assert_eq!(state.modified.rects(), &[Rect::new(1, 1, 3, 2)]);
        drop(state);

        let row = fb.read_rect(&Rect::new(1, 1, 3, 2)).await;
        assert_eq!(row, data);
    }

    #[tokio::test]
    async fn mark_rect_swaps_and_clamps() {
        let fb = fb_4x3();
        let tracker = Arc::new(UpdateTracker::new(1));
        fb.register_tracker(tracker.clone()).await;

        fb.mark_rect_modified(10, 2, -5, 0).await;
        let state = tracker.state.lock().await;
        assert_eq!(state.modified.rects(), &[Rect::new(0, 0, 4, 3)]);
    }

    #[tokio::test]
    async fn copy_conflict_downgrades_to_modified() {
        let fb = fb_4x3();
        let tracker = Arc::new(UpdateTracker::new(1));
        tracker.use_copy_rect.store(true, Ordering::Relaxed);
        fb.register_tracker(tracker.clone()).await;

        let first = Region::from_rect(Rect::new(0, 0, 2, 1));
        fb.schedule_copy_region(&first, 1, 0).await;
        let second = Region::from_rect(Rect::new(0, 1, 2, 2));
        fb.schedule_copy_region(&second, 0, 1).await;

        // The first copy's destination was downgraded to modified when
        // the vector changed.
        let state = tracker.state.lock().await;
        assert_eq!(state.modified.rects(), &[Rect::new(1, 0, 3, 1)]);
        assert_eq!(state.copy.rects(), &[Rect::new(0, 2, 2, 3)]);
        assert_eq!((state.copy_dx, state.copy_dy), (0, 1));
    }

    #[tokio::test]
    async fn do_copy_moves_pixels() {
        let fb = fb_4x3();
        // Row 0: pixels 0,1 distinct; copy them two columns right.
        let mut data = vec![0u8; 4 * 4];
        data[0..4].copy_from_slice(&[1, 2, 3, 0]);
        data[4..8].copy_from_slice(&[4, 5, 6, 0]);
        fb.write_pixels(&data, 0, 0, 4, 1).await;

        let region = Region::from_rect(Rect::new(0, 0, 2, 1));
        fb.do_copy_region(&region, 2, 0).await;

        let row = fb.read_rect(&Rect::new(0, 0, 4, 1)).await;
        assert_eq!(&row[8..12], &[1, 2, 3, 0]);
        assert_eq!(&row[12..16], &[4, 5, 6, 0]);
    }

    #[tokio::test]
    async fn cursor_draw_and_undraw_restores_pixels() {
        let fb = fb_4x3();
        let mut cursor = Cursor::from_bitmaps(2, 2, 0, 0, vec![0xC0, 0xC0], vec![0xC0, 0xC0]);
        cursor.fg = (0xFFFF, 0, 0); // visible against the zeroed framebuffer
        fb.set_cursor(Some(cursor)).await;
        fb.set_cursor_position(1, 1).await;

        let before = fb.read_rect(&fb.bounds()).await;
        let drawn = fb.draw_cursor().await;
        assert_eq!(drawn, Some(Rect::new(1, 1, 3, 3)));
        assert!(fb.cursor_is_drawn().await);

        let during = fb.read_rect(&fb.bounds()).await;
        assert_ne!(before, during);

        fb.undraw_cursor().await;
        let after = fb.read_rect(&fb.bounds()).await;
        assert_eq!(before, after);
    }
}
