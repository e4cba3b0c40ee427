//! SHM Image Pool: a fixed-capacity cache of idle shared-memory segments.
//!
//! Grounded in `shm_cache_get` / `shm_cache_add` / `shm_cache_destroy` from
//! the original display adapter: a flat array of at most 10 slots, searched
//! linearly (n is always small), with exact-fit preferred over next-biggest.

use std::sync::Mutex;

use x11bridge_proto::{BridgeError, ShmSegment};

pub const POOL_CAPACITY: usize = 10;

pub struct ImagePool {
    slots: Mutex<[Option<ShmSegment>; POOL_CAPACITY]>,
}

impl Default for ImagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl ImagePool {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([None, None, None, None, None, None, None, None, None, None]),
        }
    }

    /// Acquire a segment of at least `size` bytes: exact match first, else
    /// the smallest sufficient cached segment, else a fresh allocation.
    pub fn acquire(&self, size: usize) -> Result<ShmSegment, BridgeError> {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(index) = slots
                .iter()
                .position(|s| matches!(s, Some(seg) if seg.size == size))
            {
                return Ok(slots[index].take().unwrap());
            }

            let best = slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|seg| (i, seg.size)))
                .filter(|(_, sz)| *sz >= size)
                .min_by_key(|(_, sz)| *sz);

            if let Some((index, _)) = best {
                return Ok(slots[index].take().unwrap());
            }
        }

        allocate_segment(size)
    }

    /// Return a segment to the pool: insert into an empty slot, else evict
    /// the smallest cached segment if it is strictly smaller than this one,
    /// else destroy the segment immediately. Never rejects without freeing.
    pub fn release(&self, segment: ShmSegment) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(index) = slots.iter().position(|s| s.is_none()) {
            slots[index] = Some(segment);
            return;
        }

        let smallest = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|seg| (i, seg.size)))
            .min_by_key(|(_, sz)| *sz);

        match smallest {
            Some((index, sz)) if sz < segment.size => {
                let evicted = slots[index].replace(segment).unwrap();
                drop(slots);
                destroy_segment(evicted);
            }
            _ => {
                drop(slots);
                destroy_segment(segment);
            }
        }
    }

    /// Detach, unmap and forget every cached segment. Called on teardown.
    pub fn destroy_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter_mut() {
            if let Some(segment) = slot.take() {
                destroy_segment(segment);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

/// Allocate a fresh SysV SHM segment, map it, and unlink it from the kernel
/// namespace immediately so an abnormal process exit cannot leak it — the
/// segment lives only as long as some process keeps it attached.
fn allocate_segment(size: usize) -> Result<ShmSegment, BridgeError> {
    unsafe {
        let shmid = libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600);
        if shmid < 0 {
            return Err(BridgeError::ShmFailure(format!(
                "shmget({size}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let addr = libc::shmat(shmid, std::ptr::null(), 0);
        if addr as isize == -1 {
            let err = std::io::Error::last_os_error();
            libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
            return Err(BridgeError::ShmFailure(format!(
                "shmat(shmid={shmid}) failed: {err}"
            )));
        }

        // Mark for destruction now; the kernel frees the segment once every
        // attaching process (including one that dies abnormally) detaches.
        if libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) < 0 {
            tracing::warn!(shmid, "shmctl(IPC_RMID) failed, segment may leak");
        }

        Ok(ShmSegment {
            shmid: Some(shmid),
            size,
            server_attach_id: None,
            addr: addr as *mut u8,
        })
    }
}

fn destroy_segment(segment: ShmSegment) {
    if !segment.addr.is_null() {
        unsafe {
            if libc::shmdt(segment.addr as *const libc::c_void) < 0 {
                tracing::warn!(
                    "shmdt failed for segment of size {}: {}",
                    segment.size,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    // The display-server-side detach (xcb shm::detach against
    // server_attach_id, when the segment was ever attached) is performed by
    // the caller before the segment reaches here, since it requires the X11
    // connection handle the pool deliberately has no reference to — the
    // pool's job is local memory lifecycle only.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(size: usize) -> ShmSegment {
        allocate_segment(size).expect("allocate_segment")
    }

    #[test]
    fn exact_fit_preference() {
        let pool = ImagePool::new();
        pool.release(seg(1024));
        pool.release(seg(4096));
        let acquired = pool.acquire(1024).unwrap();
        assert_eq!(acquired.size, 1024);
        pool.release(acquired);
        pool.destroy_all();
    }

    #[test]
    fn next_biggest_when_no_exact_fit() {
        let pool = ImagePool::new();
        pool.release(seg(4096));
        pool.release(seg(8192));
        let acquired = pool.acquire(2048).unwrap();
        assert_eq!(acquired.size, 4096);
        pool.release(acquired);
        pool.destroy_all();
    }

    #[test]
    fn allocates_fresh_when_pool_empty_or_insufficient() {
        let pool = ImagePool::new();
        pool.release(seg(512));
        let acquired = pool.acquire(4096).unwrap();
        assert_eq!(acquired.size, 4096);
        pool.release(acquired);
        pool.destroy_all();
    }

    #[test]
    fn pool_s1_exact_reuse() {
        // S1: acquire [1024, 2048], release both, acquire 1024 -> same shmid, pool size 1.
        let pool = ImagePool::new();
        let a = pool.acquire(1024).unwrap();
        let first_shmid = a.shmid;
        let b = pool.acquire(2048).unwrap();
        pool.release(a);
        pool.release(b);
        let reacquired = pool.acquire(1024).unwrap();
        assert_eq!(reacquired.shmid, first_shmid);
        assert_eq!(pool.len(), 1);
        pool.release(reacquired);
        pool.destroy_all();
    }

    #[test]
    fn pool_s2_admit_largest_over_smallest() {
        // S2: fill with ten 1024-byte segments, release one 4096; smallest
        // 1024 is evicted and the 4096 admitted.
        let pool = ImagePool::new();
        for _ in 0..POOL_CAPACITY {
            pool.release(seg(1024));
        }
        assert_eq!(pool.len(), POOL_CAPACITY);
        pool.release(seg(4096));
        assert_eq!(pool.len(), POOL_CAPACITY);
        let acquired = pool.acquire(4096).unwrap();
        assert_eq!(acquired.size, 4096);
        pool.release(acquired);
        pool.destroy_all();
    }

    #[test]
    fn release_destroys_when_full_and_not_larger() {
        let pool = ImagePool::new();
        for _ in 0..POOL_CAPACITY {
            pool.release(seg(4096));
        }
        assert_eq!(pool.len(), POOL_CAPACITY);
        // Releasing a smaller segment than everything cached: destroyed
        // immediately, pool contents unchanged.
        pool.release(seg(1024));
        assert_eq!(pool.len(), POOL_CAPACITY);
        pool.destroy_all();
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let pool = ImagePool::new();
        for _ in 0..(POOL_CAPACITY * 3) {
            pool.release(seg(1024));
            assert!(pool.len() <= POOL_CAPACITY);
        }
        pool.destroy_all();
    }
}
