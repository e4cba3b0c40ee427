//! Main-loop scheduling layer: the redesign of the original's glib-based
//! timer/watch integration (spec §9 "coroutine-free event loop" flag).
//!
//! Built on a dedicated single-threaded `tokio::runtime::Runtime` so every
//! timer and watch callback runs on one thread, never concurrently with
//! another — matching spec §9's "Callbacks run on the main thread, never
//! concurrently with each other."

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchMask(u8);

impl WatchMask {
    pub const READ: WatchMask = WatchMask(0b01);
    pub const WRITE: WatchMask = WatchMask(0b10);

    pub fn contains(self, other: WatchMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for WatchMask {
    type Output = WatchMask;
    fn bitor(self, rhs: WatchMask) -> WatchMask {
        WatchMask(self.0 | rhs.0)
    }
}

pub type TimerId = u64;
pub type WatchId = u64;

struct TimerEntry {
    handle: JoinHandle<()>,
}

struct WatchEntry {
    handle: JoinHandle<()>,
}

/// Timer/I/O-watch scheduling adapter for an embedding protocol server's
/// main loop, modeled on the original's `timer_add`/`watch_add` callback
/// quartet (spec §5, §9).
pub struct Scheduler {
    runtime: Runtime,
    next_id: AtomicU64,
    timers: Mutex<std::collections::HashMap<TimerId, TimerEntry>>,
    watches: Mutex<std::collections::HashMap<WatchId, WatchEntry>>,
}

impl Scheduler {
    /// A single worker thread, not `new_current_thread()`: a current-thread
    /// runtime only polls spawned tasks while its own thread calls
    /// `block_on`, which nothing here ever does (the scheduler is driven
    /// entirely by `add_timer`/`add_watch` callers on other threads). A
    /// one-worker multi-thread runtime starts its driver thread at
    /// construction and keeps every callback on that single thread, matching
    /// spec §9's "never concurrently with each other" without requiring a
    /// `block_on` anchor anywhere in this crate.
    pub fn new() -> std::io::Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(Arc::new(Self {
            runtime,
            next_id: AtomicU64::new(1),
            timers: Mutex::new(std::collections::HashMap::new()),
            watches: Mutex::new(std::collections::HashMap::new()),
        }))
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a recurring timer firing every `interval`. Mirrors
    /// `timer_add` + an implicit `timer_start` at the given interval.
    pub fn add_timer(self: &Arc<Self>, interval: Duration, mut f: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.alloc_id();
        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                f();
            }
        });
        self.timers.lock().unwrap().insert(id, TimerEntry { handle });
        id
    }

    /// Replace a timer's interval by cancelling and not restarting it — the
    /// caller is expected to call `add_timer` again for the new interval,
    /// since the original's `timer_start` semantics (restart with a new
    /// period) has no single-call tokio equivalent without rebuilding the
    /// `interval` stream.
    pub fn timer_cancel(&self, id: TimerId) {
        if let Some(entry) = self.timers.lock().unwrap().remove(&id) {
            entry.handle.abort();
        }
    }

    pub fn timer_remove(&self, id: TimerId) {
        self.timer_cancel(id);
    }

    /// Register an fd watch; `f` is invoked with the mask of events that
    /// became ready. Spawned onto the scheduler's single-threaded runtime so
    /// it never races another callback.
    pub fn add_watch(
        self: &Arc<Self>,
        fd: RawFd,
        events: WatchMask,
        mut f: impl FnMut(WatchMask) + Send + 'static,
    ) -> std::io::Result<WatchId> {
        let id = self.alloc_id();
        let async_fd = AsyncFd::new(fd)?;
        let handle = self.runtime.spawn(async move {
            loop {
                if events.contains(WatchMask::READ) {
                    let Ok(mut guard) = async_fd.readable().await else {
                        break;
                    };
                    f(WatchMask::READ);
                    guard.clear_ready();
                } else if events.contains(WatchMask::WRITE) {
                    let Ok(mut guard) = async_fd.writable().await else {
                        break;
                    };
                    f(WatchMask::WRITE);
                    guard.clear_ready();
                } else {
                    break;
                }
            }
        });
        self.watches.lock().unwrap().insert(id, WatchEntry { handle });
        Ok(id)
    }

    pub fn watch_remove(&self, id: WatchId) {
        if let Some(entry) = self.watches.lock().unwrap().remove(&id) {
            entry.handle.abort();
        }
    }

    /// Updating the mask of a live watch requires re-registering it — tokio
    /// has no in-place readiness-interest update. Callers re-register via
    /// `add_watch` after this returns.
    pub fn watch_update_mask(&self, id: WatchId) {
        self.watch_remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn timer_fires_and_cancels() {
        let scheduler = Scheduler::new().unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        let id = scheduler.add_timer(Duration::from_millis(5), move || {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(30));
        scheduler.timer_cancel(id);
        let observed = count.load(Ordering::Relaxed);
        assert!(observed >= 1, "expected at least one tick, got {observed}");
    }
}
