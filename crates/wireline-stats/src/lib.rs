//! Runtime counters for the `stats` command.
//!
//! Each worker owns one [`ThreadStats`] handle and only ever increments its
//! own fields, so the hot path never takes a lock. The counters are still
//! atomics rather than plain integers because the `stats` command can be
//! served by any worker and needs to read every other worker's totals;
//! `Relaxed` ordering is enough since these are independent counters, not a
//! guard for any other memory.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use wireline_time::current;

/// Per-worker counters, registered once at thread boot and held for the
/// worker's lifetime.
#[derive(Default)]
pub struct ThreadStats {
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    pub cmd_delete: AtomicU64,
    pub cmd_flush: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub delete_hits: AtomicU64,
    pub delete_misses: AtomicU64,
    pub incr_hits: AtomicU64,
    pub incr_misses: AtomicU64,
    pub decr_hits: AtomicU64,
    pub decr_misses: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub curr_connections: AtomicU64,
    pub total_connections: AtomicU64,
}

impl ThreadStats {
    pub fn record_get(&self, hit: bool) {
        self.cmd_get.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self, hit: bool) {
        self.cmd_delete.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.delete_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delete_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_incr(&self, hit: bool) {
        if hit {
            self.incr_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.incr_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_decr(&self, hit: bool) {
        if hit {
            self.decr_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.decr_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_set(&self) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.cmd_flush.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.curr_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.curr_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Zeroes every command/byte counter. `curr_connections` is left alone —
    /// it reflects sockets open right now, not activity since boot, so
    /// resetting it would make the next `stats` lie about live connections.
    fn reset(&self) {
        self.cmd_get.store(0, Ordering::Relaxed);
        self.cmd_set.store(0, Ordering::Relaxed);
        self.cmd_delete.store(0, Ordering::Relaxed);
        self.cmd_flush.store(0, Ordering::Relaxed);
        self.get_hits.store(0, Ordering::Relaxed);
        self.get_misses.store(0, Ordering::Relaxed);
        self.delete_hits.store(0, Ordering::Relaxed);
        self.delete_misses.store(0, Ordering::Relaxed);
        self.incr_hits.store(0, Ordering::Relaxed);
        self.incr_misses.store(0, Ordering::Relaxed);
        self.decr_hits.store(0, Ordering::Relaxed);
        self.decr_misses.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.total_connections.store(self.curr_connections.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// A flattened sum of every registered worker's counters, plus process-wide
/// fields the `stats` reply needs that don't belong to any one worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Totals {
    pub pid: u32,
    pub uptime: u32,
    pub curr_connections: u64,
    pub total_connections: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub cmd_delete: u64,
    pub cmd_flush: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub delete_hits: u64,
    pub delete_misses: u64,
    pub incr_hits: u64,
    pub incr_misses: u64,
    pub decr_hits: u64,
    pub decr_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Process-wide registry: the set of per-worker counter blocks plus the
/// shared verbosity level that the `verbosity` command adjusts.
pub struct StatsRegistry {
    threads: Mutex<Vec<Arc<ThreadStats>>>,
    verbosity: AtomicU32,
    boot_time: u32,
    pid: u32,
}

impl StatsRegistry {
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { threads: Mutex::new(Vec::new()), verbosity: AtomicU32::new(0), boot_time: current(), pid }
    }

    /// Called once per worker thread at startup; the returned handle is kept
    /// for the life of the thread and never shared with any other thread.
    pub fn register(&self) -> Arc<ThreadStats> {
        let stats = Arc::new(ThreadStats::default());
        self.threads.lock().unwrap().push(Arc::clone(&stats));
        stats
    }

    pub fn set_verbosity(&self, level: u32) {
        self.verbosity.store(level, Ordering::Relaxed);
    }

    #[must_use]
    pub fn verbosity(&self) -> u32 {
        self.verbosity.load(Ordering::Relaxed)
    }

    /// Zeroes every worker's counters in place. Used by `stats reset`.
    pub fn reset(&self) {
        let threads = self.threads.lock().unwrap();
        for t in threads.iter() {
            t.reset();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Totals {
        let threads = self.threads.lock().unwrap();
        let mut totals = Totals { pid: self.pid, uptime: current().saturating_sub(self.boot_time), ..Totals::default() };
        for t in threads.iter() {
            totals.curr_connections += t.curr_connections.load(Ordering::Relaxed);
            totals.total_connections += t.total_connections.load(Ordering::Relaxed);
            totals.cmd_get += t.cmd_get.load(Ordering::Relaxed);
            totals.cmd_set += t.cmd_set.load(Ordering::Relaxed);
            totals.cmd_delete += t.cmd_delete.load(Ordering::Relaxed);
            totals.cmd_flush += t.cmd_flush.load(Ordering::Relaxed);
            totals.get_hits += t.get_hits.load(Ordering::Relaxed);
            totals.get_misses += t.get_misses.load(Ordering::Relaxed);
            totals.delete_hits += t.delete_hits.load(Ordering::Relaxed);
            totals.delete_misses += t.delete_misses.load(Ordering::Relaxed);
            totals.incr_hits += t.incr_hits.load(Ordering::Relaxed);
            totals.incr_misses += t.incr_misses.load(Ordering::Relaxed);
            totals.decr_hits += t.decr_hits.load(Ordering::Relaxed);
            totals.decr_misses += t.decr_misses.load(Ordering::Relaxed);
            totals.bytes_read += t.bytes_read.load(Ordering::Relaxed);
            totals.bytes_written += t.bytes_written.load(Ordering::Relaxed);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_across_registered_threads() {
        let registry = StatsRegistry::new(1234);
        let a = registry.register();
        let b = registry.register();
        a.record_get(true);
        a.record_get(false);
        b.record_get(true);
        let totals = registry.snapshot();
        assert_eq!(totals.cmd_get, 3);
        assert_eq!(totals.get_hits, 2);
        assert_eq!(totals.get_misses, 1);
    }

    #[test]
    fn verbosity_defaults_to_zero_and_is_settable() {
        let registry = StatsRegistry::new(1);
        assert_eq!(registry.verbosity(), 0);
        registry.set_verbosity(2);
        assert_eq!(registry.verbosity(), 2);
    }

    #[test]
    fn reset_zeroes_counters_but_keeps_curr_connections() {
        let registry = StatsRegistry::new(1);
        let t = registry.register();
        t.connection_opened();
        t.record_get(true);
        t.record_set();
        registry.reset();
        let totals = registry.snapshot();
        assert_eq!(totals.cmd_get, 0);
        assert_eq!(totals.cmd_set, 0);
        assert_eq!(totals.get_hits, 0);
        assert_eq!(totals.curr_connections, 1);
        assert_eq!(totals.total_connections, 1);
    }

    #[test]
    fn connection_count_tracks_open_and_close() {
        let registry = StatsRegistry::new(1);
        let t = registry.register();
        t.connection_opened();
        t.connection_opened();
        t.connection_closed();
        assert_eq!(registry.snapshot().curr_connections, 1);
        assert_eq!(registry.snapshot().total_connections, 2);
    }
}
