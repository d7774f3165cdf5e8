//! The hash-indexed, LRU-ordered value store.
//!
//! A single [`Store`] instance is shared by every worker thread behind one
//! `Mutex`. Lookups, inserts, and the LRU touch that a lookup implies all
//! happen while that lock is held; nothing here ever blocks on I/O, so the
//! critical section is always short. Item bytes are held in [`bytes::Bytes`],
//! whose reference count is what keeps a value alive while a reply built
//! from it is still queued for a vectored write on some other thread's
//! connection, long after the entry itself may have been overwritten or
//! evicted from the index.

mod arith;

use std::sync::Mutex;

use bytes::Bytes;
use hashbrown::HashMap;
use regex::bytes::Regex;
use wireline_time::{current, realtime};

pub use arith::ArithError;

const NIL: u32 = u32::MAX;

struct Node {
    key: Box<[u8]>,
    flags: u32,
    exptime: u32,
    deleted: bool,
    last_set: u32,
    value: Bytes,
    prev: u32,
    next: u32,
}

/// A pinned, reference-counted view of a stored value.
///
/// Cloning an `ItemHandle` bumps the refcount on the underlying bytes, not
/// the store's index entry: the handle remains valid to read from even after
/// the entry it was read from has been overwritten, deleted, or evicted.
#[derive(Clone, Debug)]
pub struct ItemHandle {
    pub flags: u32,
    pub value: Bytes,
}

/// How a `store` call should treat an existing entry under the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorePolicy {
    /// Only succeeds if no visible entry exists.
    Add,
    /// Always succeeds, overwriting any entry and bypassing a delete lock.
    Set,
    /// Only succeeds if a visible entry exists.
    Replace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    NotStored,
}

struct Inner {
    nodes: Vec<Node>,
    free: Vec<u32>,
    index: HashMap<Box<[u8]>, u32>,
    head: u32,
    tail: u32,
    bytes_used: usize,
    oldest_live: Option<u32>,
    evictions: u64,
    expired_unfetched: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            bytes_used: 0,
            oldest_live: None,
            evictions: 0,
            expired_unfetched: 0,
        }
    }

    fn unlink_from_list(&mut self, idx: u32) {
        let (prev, next) = {
            let n = &self.nodes[idx as usize];
            (n.prev, n.next)
        };
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let n = &mut self.nodes[idx as usize];
            n.prev = NIL;
            n.next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn touch(&mut self, idx: u32) {
        if self.head == idx {
            return;
        }
        self.unlink_from_list(idx);
        self.push_front(idx);
    }

    fn alloc_node(&mut self, node: Node) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            let idx = self.nodes.len() as u32;
            self.nodes.push(node);
            idx
        }
    }

    fn remove(&mut self, idx: u32) -> Node {
        self.unlink_from_list(idx);
        let placeholder = Node {
            key: Box::new([]),
            flags: 0,
            exptime: 0,
            deleted: true,
            last_set: 0,
            value: Bytes::new(),
            prev: NIL,
            next: NIL,
        };
        let node = std::mem::replace(&mut self.nodes[idx as usize], placeholder);
        self.index.remove(&node.key);
        self.bytes_used = self.bytes_used.saturating_sub(node.key.len() + node.value.len());
        self.free.push(idx);
        node
    }

    /// Visible iff present, not soft-deleted, not expired by its own
    /// `exptime`, and not caught by a flush watermark.
    fn is_visible(&self, idx: u32, now: u32) -> bool {
        let n = &self.nodes[idx as usize];
        if n.deleted {
            return false;
        }
        if n.exptime != 0 && n.exptime <= now {
            return false;
        }
        if let Some(watermark) = self.oldest_live {
            // Strictly older-than: an item set in the same coarse-clock
            // second as the flush (last_set == watermark) must survive, or
            // `flush_all; set k v; get k` inside one tick would wrongly miss.
            if n.last_set < watermark {
                return false;
            }
        }
        true
    }

    fn evict_lru(&mut self) -> Option<Bytes> {
        let tail = self.tail;
        if tail == NIL {
            return None;
        }
        let node = self.remove(tail);
        self.evictions += 1;
        Some(node.value)
    }
}

/// Collected counters useful to the `stats` command; cheap to snapshot
/// because they live alongside the index under the same lock.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStats {
    pub items: usize,
    pub bytes: usize,
    pub evictions: u64,
    pub expired_unfetched: u64,
}

/// The shared value store.
///
/// `byte_limit` is a soft cap: insertions past it evict least-recently-used
/// entries one at a time until there's room, the same policy the protocol
/// layer's eviction-driven `add`/`set` path expects.
pub struct Store {
    inner: Mutex<Inner>,
    byte_limit: usize,
}

impl Store {
    #[must_use]
    pub fn new(byte_limit: usize) -> Self {
        Self { inner: Mutex::new(Inner::new()), byte_limit }
    }

    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<ItemHandle> {
        let now = current();
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.index.get(key)?;
        if !inner.is_visible(idx, now) {
            if inner.nodes[idx as usize].exptime != 0 && inner.nodes[idx as usize].exptime <= now {
                inner.expired_unfetched += 1;
            }
            return None;
        }
        inner.touch(idx);
        let n = &inner.nodes[idx as usize];
        Some(ItemHandle { flags: n.flags, value: n.value.clone() })
    }

    fn visible_idx(inner: &Inner, key: &[u8], now: u32) -> Option<u32> {
        let idx = *inner.index.get(key)?;
        inner.is_visible(idx, now).then_some(idx)
    }

    fn make_room(&self, inner: &mut Inner, incoming: usize) {
        if self.byte_limit == 0 {
            return;
        }
        while inner.bytes_used + incoming > self.byte_limit {
            if inner.evict_lru().is_none() {
                break;
            }
        }
    }

    pub fn store(
        &self,
        key: &[u8],
        flags: u32,
        exptime_raw: i64,
        value: Bytes,
        policy: StorePolicy,
    ) -> StoreOutcome {
        let now = current();
        let exptime = realtime(exptime_raw);
        let mut inner = self.inner.lock().unwrap();

        let existing = inner.index.get(key).copied();
        let visible = existing.is_some_and(|idx| inner.is_visible(idx, now));
        // A delete-locked entry (still pinned inside its grace window) isn't
        // "visible", but `add` must still honor its hiddenness rather than
        // reading straight through it the way an expired/flushed entry can be.
        let delete_locked = existing.is_some_and(|idx| inner.nodes[idx as usize].deleted);

        match policy {
            StorePolicy::Add if visible || delete_locked => return StoreOutcome::NotStored,
            StorePolicy::Replace if !visible => return StoreOutcome::NotStored,
            _ => {}
        }

        let incoming = key.len() + value.len();
        if let Some(idx) = existing {
            let old_size = {
                let n = &inner.nodes[idx as usize];
                n.key.len() + n.value.len()
            };
            inner.bytes_used = inner.bytes_used.saturating_sub(old_size);
            self.make_room(&mut inner, incoming);
            let n = &mut inner.nodes[idx as usize];
            n.flags = flags;
            n.exptime = exptime;
            n.deleted = false;
            n.last_set = now;
            n.value = value;
            inner.bytes_used += incoming;
            inner.touch(idx);
        } else {
            self.make_room(&mut inner, incoming);
            let node = Node {
                key: key.into(),
                flags,
                exptime,
                deleted: false,
                last_set: now,
                value,
                prev: NIL,
                next: NIL,
            };
            let idx = inner.alloc_node(node);
            inner.index.insert(key.into(), idx);
            inner.bytes_used += incoming;
            inner.push_front(idx);
        }
        StoreOutcome::Stored
    }

    /// Numeric increment/decrement on an existing item's value. Decrements
    /// saturate at zero; increments saturate at `u64::MAX`, never wrapping.
    pub fn arithmetic(&self, key: &[u8], delta: u64, incr: bool) -> Result<u64, ArithError> {
        let now = current();
        let mut inner = self.inner.lock().unwrap();
        let idx = Self::visible_idx(&inner, key, now).ok_or(ArithError::NotFound)?;
        let current_value = {
            let n = &inner.nodes[idx as usize];
            arith::parse_u64(&n.value).ok_or(ArithError::NonNumeric)?
        };
        let next = if incr {
            current_value.saturating_add(delta)
        } else {
            current_value.saturating_sub(delta)
        };
        let rendered = Bytes::from(next.to_string().into_bytes());
        // Always a fresh allocation, never a mutation of the old bytes: a
        // reply built off the pre-increment value may still be queued for a
        // vectored write on another thread and must keep reading it intact.
        let old_len = inner.nodes[idx as usize].value.len();
        let delta_len = rendered.len() as isize - old_len as isize;
        inner.bytes_used = (inner.bytes_used as isize + delta_len).max(0) as usize;
        inner.nodes[idx as usize].value = rendered;
        Ok(next)
    }

    /// Immediate, ungraced removal. Used both for `delete <key> 0` and by the
    /// deferred-delete queue's sweep once a grace window elapses.
    pub fn unlink(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.index.get(key).copied() else {
            return false;
        };
        inner.remove(idx);
        true
    }

    /// Marks an entry as deleted without removing it, hiding it from `get`
    /// and blocking `add`/`replace` until the deferred-delete queue calls
    /// [`Store::unlink`] once the grace window passes. `set` bypasses this.
    pub fn mark_deleted(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.index.get(key) else {
            return false;
        };
        inner.nodes[idx as usize].deleted = true;
        true
    }

    /// True if the key has any entry at all — visible or delete-locked —
    /// used to tell a missing key apart from one hidden behind a lock.
    #[must_use]
    pub fn contains_locked(&self, key: &[u8]) -> bool {
        self.inner.lock().unwrap().index.contains_key(key)
    }

    /// All items whose `last_set` is at or before `deadline` become
    /// invisible immediately, without a per-item scan: `flush_all` just
    /// moves this watermark forward.
    pub fn flush_before(&self, deadline: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.oldest_live = Some(inner.oldest_live.map_or(deadline, |w| w.max(deadline)));
    }

    /// `flush_all` has no per-key pattern, so it's a single watermark bump.
    /// A pattern-matched flush can't use that trick and walks every entry.
    pub fn flush_matching(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let matches: Vec<u32> = inner
            .index
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(_, &idx)| idx)
            .collect();
        let mut count = 0;
        for idx in matches {
            inner.nodes[idx as usize].deleted = true;
            count += 1;
        }
        count
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap();
        StoreStats {
            items: inner.nodes.len() - inner.free.len(),
            bytes: inner.bytes_used,
            evictions: inner.evictions,
            expired_unfetched: inner.expired_unfetched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn add_then_add_fails_set_overwrites() {
        let store = Store::new(0);
        assert_eq!(store.store(b"k", 0, 0, bytes("v1"), StorePolicy::Add), StoreOutcome::Stored);
        assert_eq!(store.store(b"k", 0, 0, bytes("v2"), StorePolicy::Add), StoreOutcome::NotStored);
        assert_eq!(store.get(b"k").unwrap().value, bytes("v1"));
        assert_eq!(store.store(b"k", 0, 0, bytes("v3"), StorePolicy::Set), StoreOutcome::Stored);
        assert_eq!(store.get(b"k").unwrap().value, bytes("v3"));
    }

    #[test]
    fn replace_requires_existing_visible_entry() {
        let store = Store::new(0);
        assert_eq!(store.store(b"k", 0, 0, bytes("v"), StorePolicy::Replace), StoreOutcome::NotStored);
        store.store(b"k", 0, 0, bytes("v"), StorePolicy::Add);
        assert_eq!(store.store(b"k", 0, 0, bytes("v2"), StorePolicy::Replace), StoreOutcome::Stored);
    }

    #[test]
    fn delete_lock_hides_from_get_blocks_add_and_replace() {
        let store = Store::new(0);
        store.store(b"d", 0, 0, bytes("v"), StorePolicy::Add);
        store.mark_deleted(b"d");
        assert!(store.get(b"d").is_none());
        assert_eq!(store.store(b"d", 0, 0, bytes("x"), StorePolicy::Add), StoreOutcome::NotStored);
        assert_eq!(store.store(b"d", 0, 0, bytes("x"), StorePolicy::Replace), StoreOutcome::NotStored);
        assert_eq!(store.store(b"d", 0, 0, bytes("x"), StorePolicy::Set), StoreOutcome::Stored);
        assert_eq!(store.get(b"d").unwrap().value, bytes("x"));
    }

    #[test]
    fn eviction_is_strict_lru() {
        let store = Store::new(3);
        store.store(b"a", 0, 0, bytes("1"), StorePolicy::Set);
        store.store(b"b", 0, 0, bytes("1"), StorePolicy::Set);
        store.store(b"c", 0, 0, bytes("1"), StorePolicy::Set);
        assert!(store.get(b"a").is_none());
        assert!(store.get(b"b").is_some());
        assert!(store.get(b"c").is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn touching_a_key_protects_it_from_eviction() {
        let store = Store::new(3);
        store.store(b"a", 0, 0, bytes("1"), StorePolicy::Set);
        store.store(b"b", 0, 0, bytes("1"), StorePolicy::Set);
        store.get(b"a");
        store.store(b"c", 0, 0, bytes("1"), StorePolicy::Set);
        assert!(store.get(b"a").is_some());
        assert!(store.get(b"b").is_none());
    }

    #[test]
    fn increment_and_decrement_saturate() {
        let store = Store::new(0);
        store.store(b"n", 0, 0, bytes("5"), StorePolicy::Set);
        assert_eq!(store.arithmetic(b"n", 3, true).unwrap(), 8);
        assert_eq!(store.arithmetic(b"n", 100, false).unwrap(), 0);
        assert_eq!(store.arithmetic(b"missing", 1, true), Err(ArithError::NotFound));
        store.store(b"word", 0, 0, bytes("abc"), StorePolicy::Set);
        assert_eq!(store.arithmetic(b"word", 1, true), Err(ArithError::NonNumeric));
    }

    #[test]
    fn flush_all_hides_everything_set_before_the_watermark() {
        let store = Store::new(0);
        store.store(b"a", 0, 0, bytes("1"), StorePolicy::Set);
        store.flush_before(current() + 1);
        assert!(store.get(b"a").is_none());
    }

    #[test]
    fn flush_regex_only_matches_pattern() {
        let store = Store::new(0);
        store.store(b"session:1", 0, 0, bytes("1"), StorePolicy::Set);
        store.store(b"session:2", 0, 0, bytes("1"), StorePolicy::Set);
        store.store(b"other", 0, 0, bytes("1"), StorePolicy::Set);
        let pattern = Regex::new("^session:").unwrap();
        let n = store.flush_matching(&pattern);
        assert_eq!(n, 2);
        assert!(store.get(b"session:1").is_none());
        assert!(store.get(b"other").is_some());
    }
}
