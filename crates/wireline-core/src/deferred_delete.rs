//! Time-gated unlink after a soft-delete grace window.
//!
//! `delete key 5` marks the item hidden immediately (via
//! [`wireline_store::Store::mark_deleted`]) but keeps its storage pinned for
//! five more seconds before the entry is actually unlinked. This queue is
//! the thing that performs that unlink, once, after the grace period has
//! elapsed.

use std::sync::{Arc, Mutex};

use tracing::debug;
use wireline_store::Store;
use wireline_time::{Repeater, current};

struct Entry {
    key: Vec<u8>,
    deadline: u32,
}

/// Shared across every worker: any worker's `delete key <grace>` command can
/// push an entry; a single background sweeper drains it.
#[derive(Default)]
pub struct DeferredDeleteQueue {
    entries: Vec<Entry>,
}

impl DeferredDeleteQueue {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, key: Vec<u8>, grace_secs: u32, now: u32) {
        self.entries.push(Entry { key, deadline: now.saturating_add(grace_secs) });
    }

    /// Unlinks every entry whose deadline has passed. Returns how many were
    /// removed, mostly for tests and stats.
    pub fn sweep(&mut self, store: &Store, now: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            if e.deadline <= now {
                store.unlink(&e.key);
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

const SWEEP_INTERVAL_SECS: u64 = 5;

/// Spawns the background thread that sweeps the queue every five seconds.
/// The thread runs for the life of the process; there is no shutdown signal
/// because the process exit takes it down along with everything else.
pub fn spawn_sweeper(queue: Arc<Mutex<DeferredDeleteQueue>>, store: Arc<Store>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("deferred-delete-sweep".to_owned())
        .spawn(move || {
            let mut repeater = Repeater::every(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                std::thread::sleep(std::time::Duration::from_secs(1));
                if !repeater.fired() {
                    continue;
                }
                let now = current();
                let swept = queue.lock().unwrap().sweep(&store, now);
                if swept > 0 {
                    debug!(swept, "deferred-delete sweep unlinked entries");
                }
            }
        })
        .expect("failed to spawn deferred-delete sweeper thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireline_store::StorePolicy;

    #[test]
    fn sweep_unlinks_only_past_deadline_entries() {
        let store = Store::new(0);
        store.store(b"a", 0, 0, bytes::Bytes::from_static(b"1"), StorePolicy::Set);
        store.mark_deleted(b"a");
        let mut queue = DeferredDeleteQueue::new();
        queue.push(b"a".to_vec(), 5, 100);
        assert_eq!(queue.sweep(&store, 104), 0);
        assert!(queue.pending() == 1);
        assert_eq!(queue.sweep(&store, 105), 1);
        assert_eq!(queue.pending(), 0);
        assert!(!store.contains_locked(b"a"));
    }
}
