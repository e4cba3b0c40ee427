//! Display Adapter: connects to X11, receives damage/cursor/configure
//! notifications, and performs shared-memory pixel reads.
//!
//! Grounded in the original adapter's extension discovery order, damage
//! batching ("more" flag), and the scan_whole_screen/find_changed_tiles
//! diffing algorithms, translated from its out-parameter C style into
//! value-returning Rust.

use std::sync::Arc;
use std::time::Duration;

use x11rb::connection::Connection;
use x11rb::protocol::damage::{self, ConnectionExt as _};
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use x11bridge_proto::{BridgeError, CursorCommand, DamageTrust, Image, Monitor, Rect, ReleaseToken};

use crate::pool::ImagePool;
use crate::scan::{coalesce, diff_tiles_2d, DamageTrustState};
use crate::session::Session;

const BYTES_PER_PIXEL: usize = 4;
/// Consecutive sub-full damage batches are absorbed into one pending region
/// before the adapter decides trust on the terminal ("no more") event.
struct PendingDamage {
    rects: Vec<Rect>,
    is_fullscreen: bool,
}

impl PendingDamage {
    fn new() -> Self {
        Self {
            rects: Vec::new(),
            is_fullscreen: false,
        }
    }

    fn absorb(&mut self, rect: Rect, full_width: u16, full_height: u16) {
        if rect.x == 0 && rect.y == 0 && rect.width == full_width && rect.height == full_height {
            self.is_fullscreen = true;
        }
        self.rects.push(rect);
    }

    fn take(&mut self) -> (Vec<Rect>, bool) {
        (std::mem::take(&mut self.rects), std::mem::replace(&mut self.is_fullscreen, false))
    }
}

pub struct DisplayAdapter {
    conn: Arc<RustConnection>,
    root: u32,
    width: u16,
    height: u16,
    depth: u8,
    monitors: Vec<Monitor>,
    damage_id: damage::Damage,
    pool: Arc<ImagePool>,
    fullscreen: Image,
    tile_count: u32,
    trust_state: DamageTrustState,
    scanline_coalescing: bool,
    pending: PendingDamage,
    last_cursor_serial: u32,
}

impl DisplayAdapter {
    pub fn open(
        display_name: Option<&str>,
        tile_count: u32,
        trust: DamageTrust,
        scanline_coalescing: bool,
    ) -> Result<Self, BridgeError> {
        let (conn, screen_num) = RustConnection::connect(display_name)
            .map_err(|e| BridgeError::NoDisplay(Some(e.to_string())))?;

        shm::query_version(&conn)
            .and_then(|c| c.reply())
            .map_err(|_| BridgeError::MissingExtension("MIT-SHM"))?;
        xfixes::query_version(&conn, 5, 0)
            .and_then(|c| c.reply())
            .map_err(|_| BridgeError::MissingExtension("XFIXES"))?;
        damage::query_version(&conn, 1, 1)
            .and_then(|c| c.reply())
            .map_err(|_| BridgeError::MissingExtension("XDAMAGE"))?;
        x11rb::protocol::xkb::use_extension(&conn, 1, 0)
            .and_then(|c| c.reply())
            .map_err(|_| BridgeError::MissingExtension("XKB"))?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let width = screen.width_in_pixels;
        let height = screen.height_in_pixels;
        let depth = screen.root_depth;

        let monitors = fetch_monitors(&conn, root)?;

        let pool = Arc::new(ImagePool::new());

        let fullscreen_size = width as usize * height as usize * BYTES_PER_PIXEL;
        let mut fullscreen_segment = pool.acquire(fullscreen_size)?;
        attach_segment(&conn, &mut fullscreen_segment)?;
        let fullscreen = Image::new(fullscreen_segment, width, height);

        let damage_id = conn
            .generate_id()
            .map_err(|e| BridgeError::ShmFailure(e.to_string()))?;
        conn.damage_create(damage_id, root, damage::ReportLevel::RAW_RECTANGLES)
            .map_err(|e| BridgeError::ShmFailure(e.to_string()))?;

        xfixes::hide_cursor(&conn, root).map_err(|e| BridgeError::ShmFailure(e.to_string()))?;
        xfixes::select_cursor_input(&conn, root, xfixes::CursorNotifyMask::DISPLAY_CURSOR)
            .map_err(|e| BridgeError::ShmFailure(e.to_string()))?;
        conn.flush().map_err(|e| BridgeError::ShmFailure(e.to_string()))?;
        let conn = Arc::new(conn);

        Ok(Self {
            conn,
            root,
            width,
            height,
            depth,
            monitors,
            damage_id,
            pool,
            fullscreen,
            tile_count,
            trust_state: DamageTrustState::new(trust),
            scanline_coalescing,
            pending: PendingDamage::new(),
            last_cursor_serial: 0,
        })
    }

    pub fn pool(&self) -> Arc<ImagePool> {
        Arc::clone(&self.pool)
    }

    /// Shared handle to the X11 connection, for an `InputInjector` running
    /// on the remote protocol worker thread. Safe to use concurrently with
    /// this adapter's own poll loop in `run`.
    pub fn connection(&self) -> Arc<RustConnection> {
        Arc::clone(&self.conn)
    }

    pub fn geometry(&self) -> (u16, u16, u8) {
        (self.width, self.height, self.depth)
    }

    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    /// Drain pending X11 events until the session's running flag is cleared.
    /// Uses `poll_for_event` rather than the blocking `wait_for_event`, so
    /// the loop notices `Session::stop()` within one sleep interval instead
    /// of waiting on the next real event the display happens to produce —
    /// the same non-blocking poll shape the reaper loop in `hooks.rs` uses
    /// for its own "check a flag, sleep a beat" cadence.
    pub fn run(&mut self, session: &Session) {
        const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(15);

        while session.is_running() {
            let event = match self.conn.poll_for_event() {
                Ok(Some(event)) => event,
                Ok(None) => {
                    std::thread::sleep(IDLE_POLL_INTERVAL);
                    continue;
                }
                Err(_) => break,
            };

            match event {
                Event::DamageNotify(notify) => self.handle_damage_notify(notify, session),
                Event::XfixesCursorNotify(notify) => self.handle_cursor_notify(notify, session),
                Event::ConfigureNotify(notify) if notify.window == self.root => {
                    self.handle_configure_notify(session);
                }
                _ => {}
            }
        }
    }

    fn handle_damage_notify(&mut self, notify: damage::NotifyEvent, session: &Session) {
        let rect = Rect::new(
            notify.area.x,
            notify.area.y,
            notify.area.width,
            notify.area.height,
        );
        // XDamage packs a "more notifications in this batch" flag into the
        // high bit of `level`.
        let more = notify.level & 0x80 != 0;

        self.pending.absorb(rect, self.width, self.height);
        if more {
            return;
        }

        let _ = damage::subtract(&self.conn, self.damage_id, x11rb::NONE, x11rb::NONE);
        let _ = self.conn.flush();

        let (rects, is_fullscreen) = self.pending.take();
        let trust = self.trust_state.decide(is_fullscreen);

        let requests: Vec<_> = if trust {
            rects
                .into_iter()
                .map(x11bridge_proto::ScanRequest::DamageReport)
                .collect()
        } else {
            vec![x11bridge_proto::ScanRequest::FullscreenRequest]
        };

        for request in coalesce(&requests, self.scanline_coalescing) {
            self.process_scan_request(request, session);
        }
    }

    fn handle_cursor_notify(&mut self, notify: xfixes::CursorNotifyEvent, session: &Session) {
        if notify.cursor_serial == self.last_cursor_serial {
            return;
        }
        self.last_cursor_serial = notify.cursor_serial;

        let reply = match xfixes::get_cursor_image(&self.conn).and_then(|c| c.reply()) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("get_cursor_image failed: {e}");
                return;
            }
        };

        let mut argb = Vec::with_capacity(reply.cursor_image.len() * 4);
        for pixel in &reply.cursor_image {
            argb.extend_from_slice(&pixel.to_ne_bytes());
        }

        let cmd = CursorCommand {
            x: reply.x,
            y: reply.y,
            hot_x: reply.xhot,
            hot_y: reply.yhot,
            width: reply.width,
            height: reply.height,
            token: ReleaseToken::FreeHeap(argb.into_boxed_slice()),
        };
        if let Some(rejected) = session.push_cursor(cmd) {
            tracing::warn!("cursor queue push failed, dropping cursor update");
            session.free_token(rejected.token);
        }
    }

    fn handle_configure_notify(&mut self, session: &Session) {
        let geometry = match self.conn.get_geometry(self.root).and_then(|c| c.reply()) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("get_geometry failed: {e}");
                return;
            }
        };

        self.width = geometry.width;
        self.height = geometry.height;
        self.depth = geometry.depth;

        self.monitors = fetch_monitors(&self.conn, self.root).unwrap_or_else(|e| {
            tracing::warn!("failed to refresh monitor list: {e}");
            std::mem::take(&mut self.monitors)
        });

        session.handle_resize(self.width, self.height, self.monitors.len(), &self.pool);

        // Reallocate our retained fullscreen image at the new geometry.
        let mut segment = match self
            .pool
            .acquire(self.width as usize * self.height as usize * BYTES_PER_PIXEL)
        {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("out of memory reallocating fullscreen image: {e}");
                return;
            }
        };
        if let Err(e) = attach_segment(&self.conn, &mut segment) {
            tracing::warn!("failed to attach reallocated fullscreen segment: {e}");
        }
        let old = std::mem::replace(&mut self.fullscreen, Image::new(segment, self.width, self.height));
        self.pool.release(old.segment);
    }

    fn process_scan_request(&mut self, request: x11bridge_proto::ScanRequest, session: &Session) {
        match request {
            x11bridge_proto::ScanRequest::DamageReport(rect) => {
                self.emit_damage_draw(rect, session);
            }
            x11bridge_proto::ScanRequest::ScanlineReport(rect) => {
                self.emit_damage_draw(rect, session);
            }
            x11bridge_proto::ScanRequest::FullscreenReport
            | x11bridge_proto::ScanRequest::FullscreenRequest => {
                self.scan_whole_screen(session);
            }
        }
    }

    fn emit_damage_draw(&mut self, rect: Rect, session: &Session) {
        if rect.width == 0 || rect.height == 0 {
            return;
        }

        let size = rect.width as usize * rect.height as usize * BYTES_PER_PIXEL;
        let mut segment = match self.pool.acquire(size) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("pool acquisition failed, dropping scan: {e}");
                return;
            }
        };
        if let Err(e) = attach_segment(&self.conn, &mut segment) {
            tracing::warn!("pixel read failed, dropping scan: {e}");
            self.pool.release(segment);
            return;
        }
        let mut image = Image::new(segment, rect.width, rect.height);

        if let Err(e) = self.read_shm_image(&mut image, rect.x, rect.y) {
            tracing::warn!("pixel read failed, dropping scan: {e}");
            self.pool.release(image.segment);
            return;
        }

        self.copy_into_fullscreen(&image, rect);

        if let Some(rejected) = session.push_draw(rect, ReleaseToken::FreeImage(image)) {
            tracing::warn!("draw queue push failed, dropping command and freeing image");
            session.free_token(rejected);
        }
    }

    /// Allocate a fresh full-frame image, pull the whole root, diff against
    /// the retained `fullscreen`, emit one draw command per changed tile,
    /// and return the fresh frame to the pool rather than publishing it
    /// (letting the next damage cycle fold those pixels into `fullscreen`
    /// incrementally keeps a single code path for "what does the remote
    /// side currently have").
    fn scan_whole_screen(&mut self, session: &Session) {
        let size = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        let mut segment = match self.pool.acquire(size) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("pool acquisition failed for fullscreen scan: {e}");
                return;
            }
        };
        if let Err(e) = attach_segment(&self.conn, &mut segment) {
            tracing::warn!("failed to attach fullscreen scan segment: {e}");
            self.pool.release(segment);
            return;
        }
        let mut fresh = Image::new(segment, self.width, self.height);

        if let Err(e) = self.read_shm_image(&mut fresh, 0, 0) {
            tracing::warn!("fullscreen pixel read failed: {e}");
            self.pool.release(fresh.segment);
            return;
        }

        if fresh.width != self.fullscreen.width || fresh.height != self.fullscreen.height {
            // Mid-resize race: abandon this scan, matching the original's
            // "abandons the scan and returns zero tiles changed."
            self.pool.release(fresh.segment);
            return;
        }

        // V x H tile grid, not a per-row diff: a changed tile's rect spans
        // its whole band (see `diff_tiles_2d`), matching
        // `display_scan_whole_screen`'s `tiles[v_tile][h_tile]` grid.
        let changed_rects = diff_tiles_2d(
            self.fullscreen.segment.as_slice(),
            fresh.segment.as_slice(),
            self.width,
            self.height,
            BYTES_PER_PIXEL,
            self.tile_count,
            self.tile_count,
        );

        for rect in changed_rects {
            let size = rect.width as usize * rect.height as usize * BYTES_PER_PIXEL;
            let segment = match self.pool.acquire(size) {
                Ok(segment) => segment,
                Err(e) => {
                    tracing::warn!("pool acquisition failed for tile, dropping: {e}");
                    continue;
                }
            };
            let mut tile_image = Image::new(segment, rect.width, rect.height);
            for row in 0..rect.height {
                let src = fresh.row((rect.y as u16) + row);
                let byte_start = rect.x as usize * BYTES_PER_PIXEL;
                let byte_end = byte_start + rect.width as usize * BYTES_PER_PIXEL;
                tile_image.row_mut(row).copy_from_slice(&src[byte_start..byte_end]);
            }

            // `fullscreen` is deliberately left untouched here: folding
            // these pixels in now would let a later incremental damage
            // event diff against data the remote side never received,
            // defeating the scanline-coalescing optimization. Only
            // `emit_damage_draw`'s `copy_into_fullscreen` call updates it.
            if let Some(rejected) = session.push_draw(rect, ReleaseToken::FreeImage(tile_image)) {
                tracing::warn!("draw queue push failed, dropping tile and freeing image");
                session.free_token(rejected);
            }
        }

        self.pool.release(fresh.segment);
    }

    /// Copy `src`'s pixels into `fullscreen` at `rect`'s origin, clipped to
    /// current geometry. Skipped entirely if the rect no longer fits,
    /// guarding against a resize race.
    fn copy_into_fullscreen(&mut self, src: &Image, rect: Rect) {
        if !rect.fits_within(self.fullscreen.width, self.fullscreen.height) {
            return;
        }
        for row in 0..rect.height {
            let dst_row = self.fullscreen.row_mut((rect.y as u16) + row);
            let byte_start = rect.x as usize * BYTES_PER_PIXEL;
            let byte_end = byte_start + rect.width as usize * BYTES_PER_PIXEL;
            dst_row[byte_start..byte_end].copy_from_slice(src.row(row));
        }
    }

    /// Synchronous SHM image pull of `target`'s rectangle at `(x, y)`.
    fn read_shm_image(&self, target: &mut Image, x: i16, y: i16) -> Result<(), BridgeError> {
        let seg = target
            .segment
            .server_attach_id
            .ok_or_else(|| BridgeError::ReadFailure("image segment not attached".into()))?;

        shm::get_image(
            &self.conn,
            self.root,
            x,
            y,
            target.width,
            target.height,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            shm::Seg::from(seg),
            0,
        )
        .and_then(|c| c.reply())
        .map_err(|e| BridgeError::ReadFailure(e.to_string()))?;

        Ok(())
    }
}

fn fetch_monitors(conn: &RustConnection, root: u32) -> Result<Vec<Monitor>, BridgeError> {
    let reply = conn
        .randr_get_monitors(root, true)
        .map_err(|e| BridgeError::ShmFailure(e.to_string()))?
        .reply()
        .map_err(|e| BridgeError::ShmFailure(e.to_string()))?;

    Ok(reply
        .monitors
        .into_iter()
        .enumerate()
        .map(|(index, m)| Monitor {
            index,
            x: m.x,
            y: m.y,
            width: m.width,
            height: m.height,
        })
        .collect())
}

/// Attach a freshly allocated SHM segment to the display server so a
/// subsequent `shm::get_image` can target it. A no-op if the segment was
/// already attached in an earlier life (it stays attached for as long as
/// the pool keeps recycling it — see spec §4.1).
fn attach_segment(conn: &RustConnection, segment: &mut x11bridge_proto::ShmSegment) -> Result<(), BridgeError> {
    if segment.server_attach_id.is_some() {
        return Ok(());
    }
    let shmid = segment
        .shmid
        .ok_or_else(|| BridgeError::ShmFailure("segment has no shmid to attach".into()))?;
    let seg_id = conn
        .generate_id()
        .map_err(|e| BridgeError::ShmFailure(e.to_string()))?;
    shm::attach(conn, seg_id, shmid as u32, false)
        .and_then(|c| c.check())
        .map_err(|e| BridgeError::ShmFailure(e.to_string()))?;
    segment.server_attach_id = Some(seg_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::diff_tiles_2d;

    /// S4: `scan_whole_screen`'s tile diff is the same `diff_tiles_2d` this
    /// module feeds from `fullscreen`/the fresh frame's raw buffers — a
    /// live X11 connection isn't needed to exercise the tiling itself, only
    /// to produce those two buffers. Identical frames -> 0 tiles changed;
    /// a single differing byte inside one 32x32 band -> exactly one tile
    /// changed, sized to the whole band rather than one row.
    #[test]
    fn s4_full_screen_diff_matches_scan_whole_screen_tiling() {
        let width = 320u16;
        let height = 320u16;
        let stride = width as usize * BYTES_PER_PIXEL;
        let old = vec![0u8; stride * height as usize];
        let mut new = old.clone();

        let unchanged = diff_tiles_2d(&old, &new, width, height, BYTES_PER_PIXEL, 32, 32);
        assert!(unchanged.is_empty());

        // Perturb one pixel inside vertical band 5 / horizontal band 10.
        let band_row_start = (5 * height as u32 / 32) as usize;
        let band_col_start = (10 * width as u32 / 32) as usize;
        let byte = band_row_start * stride + band_col_start * BYTES_PER_PIXEL;
        new[byte] ^= 0xFF;

        let changed = diff_tiles_2d(&old, &new, width, height, BYTES_PER_PIXEL, 32, 32);
        assert_eq!(changed.len(), 1, "exactly one tile changed for that band");
        assert_eq!(changed[0].height, (height / 32) as u16);
    }
}
