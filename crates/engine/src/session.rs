//! Session Coordinator: owns the draw/cursor queues, the resize-
//! serialization protocol, and the running/draw-in-progress lifecycle
//! flags described in spec §4.5 and §5.
//!
//! Grounded in `session.c`'s `flush_and_lock` idiom (spin-yield while a
//! draw is outstanding, then take the coordinator mutex) and its
//! `session_handle_resize` / `session_recreate_primary` pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use x11bridge_proto::{CursorCommand, DrawCommand, Image, ReleaseToken, TokenTable};

use crate::pool::ImagePool;

const QUEUE_CAPACITY: usize = 256;

struct CoordinatorState {
    width: u16,
    height: u16,
    monitor_count: usize,
    primary: Option<Image>,
}

pub struct Session {
    draw_tx: Sender<DrawCommand>,
    draw_rx: Receiver<DrawCommand>,
    cursor_tx: Sender<CursorCommand>,
    cursor_rx: Receiver<CursorCommand>,
    state: Mutex<CoordinatorState>,
    pool: Arc<ImagePool>,
    running: AtomicBool,
    draw_in_progress: AtomicBool,
    /// Cookie table for release tokens that must cross the
    /// `RemoteBridge::async_complete` boundary (monitor-config commands;
    /// see spec §4.4). Draw/cursor commands carry their token inline and
    /// never touch this table.
    monitor_tokens: Mutex<TokenTable>,
}

impl Session {
    pub fn new(pool: Arc<ImagePool>) -> Self {
        let (draw_tx, draw_rx) = bounded(QUEUE_CAPACITY);
        let (cursor_tx, cursor_rx) = bounded(QUEUE_CAPACITY);
        Self {
            draw_tx,
            draw_rx,
            cursor_tx,
            cursor_rx,
            state: Mutex::new(CoordinatorState {
                width: 0,
                height: 0,
                monitor_count: 0,
                primary: None,
            }),
            pool,
            running: AtomicBool::new(false),
            draw_in_progress: AtomicBool::new(false),
            monitor_tokens: Mutex::new(TokenTable::new()),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Flip the running flag so the blocked display thread's next wakeup
    /// (or a concurrent socket shutdown) observes teardown.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Push a draw command. On success returns `None`. On failure — queue
    /// full or the consumer side disconnected — returns the token back so
    /// the caller can free it immediately, per spec §4.3.5: "Queue push
    /// failure: drop the command and free its image immediately."
    pub fn push_draw(&self, rect: x11bridge_proto::Rect, token: ReleaseToken) -> Option<ReleaseToken> {
        match self.draw_tx.try_send(DrawCommand { rect, token }) {
            Ok(()) => None,
            Err(e) => Some(e.into_inner().token),
        }
    }

    /// As `push_draw`, for cursor commands: returns the rejected command
    /// back on failure so its token can be freed.
    pub fn push_cursor(&self, cmd: CursorCommand) -> Option<CursorCommand> {
        self.cursor_tx.try_send(cmd).err().map(|e| e.into_inner())
    }

    /// Non-blocking pop. Sets the draw-in-progress flag on success; cleared
    /// by `complete_draw` once the popped command's token is released.
    pub fn pop_draw(&self) -> Option<DrawCommand> {
        match self.draw_rx.try_recv() {
            Ok(cmd) => {
                self.draw_in_progress.store(true, Ordering::Release);
                Some(cmd)
            }
            Err(_) => None,
        }
    }

    pub fn draw_waiting(&self) -> bool {
        !self.draw_rx.is_empty()
    }

    pub fn pop_cursor(&self) -> Option<CursorCommand> {
        self.cursor_rx.try_recv().ok()
    }

    pub fn cursor_waiting(&self) -> bool {
        !self.cursor_rx.is_empty()
    }

    /// Called once a popped draw command's release token has been consumed
    /// (via `release_resource`). Clears draw-in-progress so a concurrent
    /// `recreate_primary` can proceed.
    pub fn complete_draw(&self) {
        self.draw_in_progress.store(false, Ordering::Release);
    }

    /// Free a release token outside the queue (pool acquisition failure,
    /// push failure, or normal `release_resource`/`async_complete`
    /// dispatch). Returns the freed image's segment to the pool; heap
    /// tokens are simply dropped.
    pub fn free_token(&self, token: ReleaseToken) {
        if let ReleaseToken::FreeImage(image) = token {
            self.pool.release(image.segment);
        }
    }

    pub fn tokens(&self) -> &Mutex<TokenTable> {
        &self.monitor_tokens
    }

    pub fn pool(&self) -> Arc<ImagePool> {
        Arc::clone(&self.pool)
    }

    /// Spin-yield while a draw is in flight, then take the coordinator
    /// lock. Exact translation of `session.c`'s `sched_yield` loop plus
    /// `g_mutex_lock` — this, not a condvar, is the idiom because the
    /// in-flight window is always microseconds long.
    fn flush_and_lock(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        while self.draw_in_progress.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// §4.5 `recreate_primary`: flush pending draws (releasing each one's
    /// backing image to the pool), destroy the old primary, reallocate it
    /// at the new geometry.
    pub fn recreate_primary(&self, width: u16, height: u16) -> Result<(), x11bridge_proto::BridgeError> {
        let mut state = self.flush_and_lock();

        while let Ok(cmd) = self.draw_rx.try_recv() {
            self.free_token(cmd.token);
        }

        if let Some(old) = state.primary.take() {
            self.pool.release(old.segment);
        }

        let size = width as usize * height as usize * x11bridge_proto::BYTES_PER_PIXEL;
        let segment = self.pool.acquire(size)?;
        state.primary = Some(Image::new(segment, width, height));
        state.width = width;
        state.height = height;

        Ok(())
    }

    /// §4.5 `handle_resize`: compare against the remote's last-known
    /// geometry/monitor count and recreate the primary only on an actual
    /// change, matching `session_handle_resize`'s early-out.
    pub fn handle_resize(&self, width: u16, height: u16, monitor_count: usize, _pool: &Arc<ImagePool>) {
        let changed = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.width != width || state.height != height || state.monitor_count != monitor_count
        };
        if !changed {
            return;
        }

        if let Err(e) = self.recreate_primary(width, height) {
            tracing::warn!("recreate_primary failed: {e}");
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.monitor_count = monitor_count;
    }

    /// Base address of the current primary surface's mapped segment, for
    /// `get_init_info`'s memslot range. `None` before the first resize.
    pub fn primary_base_ptr(&self) -> Option<*mut u8> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.primary.as_ref().map(|img| img.segment.addr)
    }

    /// `destroy()`: unref both queues (freeing every outstanding token) and
    /// release the primary. Called once the display and protocol threads
    /// have both been joined.
    pub fn destroy(&self) {
        while let Ok(cmd) = self.draw_rx.try_recv() {
            self.free_token(cmd.token);
        }
        while let Ok(cmd) = self.cursor_rx.try_recv() {
            self.free_token(cmd.token);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(primary) = state.primary.take() {
            self.pool.release(primary.segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11bridge_proto::Rect;

    fn test_session() -> Session {
        Session::new(Arc::new(ImagePool::new()))
    }

    #[test]
    fn pop_draw_sets_in_progress_until_completed() {
        let session = test_session();
        let token = ReleaseToken::FreeHeap(Box::new([1, 2, 3]));
        assert!(session.push_draw(Rect::new(0, 0, 1, 1), token).is_none());

        let cmd = session.pop_draw().expect("draw queued");
        assert!(session.draw_in_progress.load(Ordering::Acquire));
        session.free_token(cmd.token);
        session.complete_draw();
        assert!(!session.draw_in_progress.load(Ordering::Acquire));
    }

    #[test]
    fn draw_waiting_reflects_queue_state() {
        let session = test_session();
        assert!(!session.draw_waiting());
        session.push_draw(Rect::new(0, 0, 1, 1), ReleaseToken::FreeHeap(Box::new([0])));
        assert!(session.draw_waiting());
        session.pop_draw();
        assert!(!session.draw_waiting());
    }

    #[test]
    fn s5_resize_reallocates_primary_and_drains_queue() {
        let session = test_session();
        session.recreate_primary(1024, 768).unwrap();
        assert_eq!(session.primary_base_ptr().is_some(), true);

        // Two draws queued, as in S5.
        session.push_draw(Rect::new(0, 0, 10, 10), ReleaseToken::FreeHeap(Box::new([0; 4])));
        session.push_draw(Rect::new(5, 5, 10, 10), ReleaseToken::FreeHeap(Box::new([0; 4])));
        assert!(session.draw_waiting());

        session.handle_resize(1920, 1080, 1, &Arc::new(ImagePool::new()));

        // recreate_primary drains the queue as part of flush-and-lock.
        assert!(!session.draw_waiting());
        let state = session.state.lock().unwrap();
        assert_eq!((state.width, state.height), (1920, 1080));
        assert_eq!(state.primary.as_ref().unwrap().width, 1920);
        assert_eq!(state.primary.as_ref().unwrap().height, 1080);
    }

    #[test]
    fn handle_resize_is_noop_when_geometry_unchanged() {
        let session = test_session();
        session.recreate_primary(800, 600).unwrap();
        let before = session.primary_base_ptr();
        session.handle_resize(800, 600, 0, &Arc::new(ImagePool::new()));
        assert_eq!(session.primary_base_ptr(), before);
    }

    #[test]
    fn destroy_frees_outstanding_tokens() {
        let session = test_session();
        session.push_draw(Rect::new(0, 0, 1, 1), ReleaseToken::FreeHeap(Box::new([1])));
        session.push_cursor(CursorCommand {
            x: 0,
            y: 0,
            hot_x: 0,
            hot_y: 0,
            width: 1,
            height: 1,
            token: ReleaseToken::FreeHeap(Box::new([1, 2, 3, 4])),
        });
        session.destroy();
        assert!(!session.draw_waiting());
        assert!(!session.cursor_waiting());
    }
}
