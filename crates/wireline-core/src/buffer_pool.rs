//! Recyclable, page-sized read/write buffers shared by one worker's
//! connections.
//!
//! A connection's read and write buffers are checked out from here instead
//! of allocated fresh on every accept. A buffer that grew well past its
//! starting size while handling some unusually large request is dropped
//! rather than recycled, so one oversized request doesn't pin megabytes of
//! idle capacity onto every future connection that happens to reuse it.

pub const PAGE_SIZE: usize = 16 * 1024;
const HIGH_WATER_FACTOR: usize = 8;

/// Per-worker pool of reusable byte buffers.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    cap: usize,
    acquired: u64,
    released: u64,
    freed_oversized: u64,
}

impl BufferPool {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { free: Vec::with_capacity(cap), cap, acquired: 0, released: 0, freed_oversized: 0 }
    }

    /// Sizes a pool from the `-C` total-conn-buffer-bytes budget, divided
    /// evenly across `worker_count` workers and then into page-sized slots.
    #[must_use]
    pub fn from_byte_budget(total_bytes: usize, worker_count: usize) -> Self {
        let per_worker = total_bytes / worker_count.max(1);
        Self::new((per_worker / PAGE_SIZE).max(8))
    }

    /// Checks out a page-sized buffer, reusing one from the freelist if
    /// available. Never fails: an allocation failure here would be a process
    /// abort, not something the protocol layer can recover from, so this
    /// stays infallible and lets the allocator panic on true exhaustion.
    pub fn acquire(&mut self) -> Vec<u8> {
        self.acquired += 1;
        self.free.pop().unwrap_or_else(|| Vec::with_capacity(PAGE_SIZE))
    }

    /// Returns a buffer to the pool. `used_bytes` is the high-water mark the
    /// caller observed while the buffer was checked out; a buffer that grew
    /// past `HIGH_WATER_FACTOR * PAGE_SIZE` is dropped instead of recycled.
    pub fn release(&mut self, mut buf: Vec<u8>, used_bytes: usize) {
        self.released += 1;
        if used_bytes > PAGE_SIZE * HIGH_WATER_FACTOR || buf.capacity() > PAGE_SIZE * HIGH_WATER_FACTOR {
            self.freed_oversized += 1;
            return;
        }
        buf.clear();
        if self.free.len() < self.cap {
            self.free.push(buf);
        }
    }

    #[must_use]
    pub fn group_stats(&self) -> String {
        format!(
            "free_buffers={} acquired={} released={} freed_oversized={}",
            self.free.len(),
            self.acquired,
            self.released,
            self.freed_oversized
        )
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_normally_sized_buffers() {
        let mut pool = BufferPool::new(4);
        let buf = pool.acquire();
        pool.release(buf, 128);
        assert_eq!(pool.free.len(), 1);
        let _buf = pool.acquire();
        assert_eq!(pool.free.len(), 0);
    }

    #[test]
    fn drops_buffers_that_grew_past_high_water() {
        let mut pool = BufferPool::new(4);
        let buf = vec![0u8; PAGE_SIZE * HIGH_WATER_FACTOR + 1];
        pool.release(buf, PAGE_SIZE * HIGH_WATER_FACTOR + 1);
        assert_eq!(pool.free.len(), 0);
        assert_eq!(pool.freed_oversized, 1);
    }
}
