//! The per-connection state machine: owns the socket, buffers, and I/O
//! cursors, and drives one connection from `reading` through however many
//! `nread`/`swallow`/`write` detours a request needs and back again.
//!
//! States are a closed enum (see [`ConnState`]); [`Connection::set_state`]
//! is the only place that changes it, so entry actions (compacting the read
//! buffer on the way back into `reading`) happen in exactly one spot instead
//! of being scattered across every call site.

use std::{
    io::{self, Read},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use mio::{Interest, Registry, Token};
use tracing::debug;
use wireline_stats::{StatsRegistry, ThreadStats};
use wireline_store::{ArithError, Store, StoreOutcome};

use crate::{
    buffer_pool::BufferPool,
    deferred_delete::DeferredDeleteQueue,
    managed::BucketTable,
    protocol::{self, Dispatch, PendingStore, ProtocolError},
    reply::{ReplyAssembler, TransmitOutcome},
    transport::Transport,
};

const INITIAL_READ_BUF: usize = 4096;
const READ_GROW_CHUNK: usize = 4096;
/// Sanity cap on a store payload; larger requests are rejected via the
/// `swallow` path instead of growing the accumulator unboundedly.
const MAX_VALUE_LEN: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    NRead,
    Swallow,
    Write,
    MWrite,
    Closing,
}

pub enum ConnOutcome {
    Alive,
    Closed,
}

struct PendingPayload {
    spec: PendingStore,
    data: Vec<u8>,
}

/// Everything a dispatch needs that isn't private to one connection: the
/// shared store, this worker's stats handle, the deferred-delete queue, the
/// managed-mode bucket table (if enabled), and the process-wide stats
/// registry (for `stats` snapshots and `verbosity`).
pub struct Handlers<'a> {
    pub store: &'a Store,
    pub stats: &'a ThreadStats,
    pub deferred: &'a Mutex<DeferredDeleteQueue>,
    pub buckets: Option<&'a BucketTable>,
    pub registry: &'a StatsRegistry,
    pub version: &'static str,
    pub buffer_pool: &'a BufferPool,
}

pub struct Connection {
    pub token: Token,
    stream: Transport,
    pub peer_addr: String,
    state: ConnState,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_end: usize,
    read_high_water: usize,
    reply: ReplyAssembler,
    writable_armed: bool,
    pending_store: Option<PendingPayload>,
    swallow_remaining: usize,
    reply_after_swallow: Option<Bytes>,
    stats: Arc<ThreadStats>,
}

impl Connection {
    /// `read_buf` is normally checked out of the worker's [`crate::buffer_pool::BufferPool`]
    /// rather than allocated fresh per accept; callers that don't care about pooling (tests)
    /// can hand in any buffer, including an empty one.
    #[must_use]
    pub fn new(token: Token, stream: Transport, peer_addr: String, stats: Arc<ThreadStats>, mut read_buf: Vec<u8>) -> Self {
        stats.connection_opened();
        if read_buf.len() < INITIAL_READ_BUF {
            read_buf.resize(INITIAL_READ_BUF, 0);
        }
        let read_high_water = read_buf.len();
        Self {
            token,
            stream,
            peer_addr,
            state: ConnState::Reading,
            read_buf,
            read_pos: 0,
            read_end: 0,
            read_high_water,
            reply: ReplyAssembler::new(false),
            writable_armed: false,
            pending_store: None,
            swallow_remaining: 0,
            reply_after_swallow: None,
            stats,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Registers the newly accepted socket for readable interest. Called by
    /// the worker once, right after construction.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    fn set_state(&mut self, state: ConnState) {
        if state == ConnState::Reading {
            self.compact_read_buf();
        }
        self.state = state;
    }

    /// Moves any unread tail to the front of the buffer, and shrinks it back
    /// down if it grew well past its starting size while handling a large
    /// request.
    fn compact_read_buf(&mut self) {
        if self.read_pos > 0 {
            self.read_buf.copy_within(self.read_pos..self.read_end, 0);
            self.read_end -= self.read_pos;
            self.read_pos = 0;
        }
        if self.read_buf.len() > INITIAL_READ_BUF * 8 && self.read_end < INITIAL_READ_BUF {
            self.read_buf.truncate(INITIAL_READ_BUF);
            self.read_buf.resize(INITIAL_READ_BUF, 0);
        }
    }

    fn ensure_room(&mut self, extra: usize) {
        if self.read_buf.len() - self.read_end < extra {
            self.read_buf.resize(self.read_end + extra.max(READ_GROW_CHUNK), 0);
            self.read_high_water = self.read_high_water.max(self.read_buf.len());
        }
    }

    /// Finds a `\n`-terminated line in the unconsumed portion of the read
    /// buffer (tolerating a bare `\n` without `\r`, same leniency real line
    /// protocols extend to hand-typed `nc`/`telnet` sessions) and returns
    /// its content with any trailing `\r` stripped. Advances `read_pos` past
    /// the consumed line including its terminator.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let haystack = &self.read_buf[self.read_pos..self.read_end];
        let nl = haystack.iter().position(|&b| b == b'\n')?;
        let mut end = nl;
        if end > 0 && haystack[end - 1] == b'\r' {
            end -= 1;
        }
        let line = haystack[..end].to_vec();
        self.read_pos += nl + 1;
        Some(line)
    }

    fn queue_line_reply(&mut self, text: impl Into<Bytes>) {
        self.reply.add_iov(text.into(), true);
    }

    /// Runs this connection until it would block, exhausts its per-event
    /// request budget, or reaches `closing`.
    pub fn drive(&mut self, registry: &Registry, readable: bool, writable: bool, handlers: &Handlers<'_>, reqs_per_event: u32) -> ConnOutcome {
        let mut budget = reqs_per_event;
        let mut saw_readable = readable;
        let saw_writable = writable;
        loop {
            match self.state {
                ConnState::Reading => {
                    if let Some(line) = self.take_line() {
                        if budget == 0 {
                            return self.yield_alive(registry);
                        }
                        budget -= 1;
                        self.handle_line(&line, handlers);
                        continue;
                    }
                    if !saw_readable {
                        return self.yield_alive(registry);
                    }
                    match self.fill_from_socket() {
                        FillOutcome::Filled => continue,
                        FillOutcome::WouldBlock => {
                            saw_readable = false;
                            return self.yield_alive(registry);
                        }
                        FillOutcome::Eof | FillOutcome::Err => {
                            self.set_state(ConnState::Closing);
                        }
                    }
                }
                ConnState::NRead => {
                    self.advance_nread(saw_readable, handlers);
                    if matches!(self.state, ConnState::NRead) && !saw_readable {
                        return ConnOutcome::Alive;
                    }
                }
                ConnState::Swallow => {
                    self.advance_swallow(saw_readable);
                    if matches!(self.state, ConnState::Swallow) && !saw_readable {
                        return ConnOutcome::Alive;
                    }
                }
                ConnState::Write => {
                    self.set_state(ConnState::MWrite);
                }
                ConnState::MWrite => {
                    if !saw_writable && self.writable_armed {
                        return ConnOutcome::Alive;
                    }
                    match self.reply.transmit_stream(&mut self.stream) {
                        TransmitOutcome::Complete => {
                            self.reply.clear();
                            self.disarm_writable(registry);
                            self.set_state(ConnState::Reading);
                        }
                        TransmitOutcome::Incomplete | TransmitOutcome::SoftError => {
                            self.arm_writable(registry);
                            return ConnOutcome::Alive;
                        }
                        TransmitOutcome::HardError => {
                            self.set_state(ConnState::Closing);
                        }
                    }
                }
                ConnState::Closing => {
                    return ConnOutcome::Closed;
                }
            }
        }
    }

    fn yield_alive(&mut self, registry: &Registry) -> ConnOutcome {
        if !self.reply.is_empty() {
            self.arm_writable(registry);
        }
        ConnOutcome::Alive
    }

    fn arm_writable(&mut self, registry: &Registry) {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE) {
                debug!(?err, "connection: failed to arm writable");
            }
            self.writable_armed = true;
        }
    }

    fn disarm_writable(&mut self, registry: &Registry) {
        if self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE) {
                debug!(?err, "connection: failed to disarm writable");
            }
            self.writable_armed = false;
        }
    }

    fn fill_from_socket(&mut self) -> FillOutcome {
        self.ensure_room(READ_GROW_CHUNK);
        match self.stream.read(&mut self.read_buf[self.read_end..]) {
            Ok(0) => FillOutcome::Eof,
            Ok(n) => {
                self.read_end += n;
                self.stats.add_bytes_read(n as u64);
                FillOutcome::Filled
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => FillOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => FillOutcome::Filled,
            Err(err) => {
                debug!(?err, "connection: read failed");
                FillOutcome::Err
            }
        }
    }

    fn handle_line(&mut self, line: &[u8], handlers: &Handlers<'_>) {
        match protocol::parse(line) {
            Ok(None) => {}
            Ok(Some(dispatch)) => self.dispatch(dispatch, handlers),
            Err(ProtocolError::UnknownCommand) => {
                self.queue_line_reply(Bytes::from_static(b"ERROR\r\n"));
                self.set_state(ConnState::Write);
            }
            Err(ProtocolError::ClientError(detail)) => {
                self.queue_line_reply(Bytes::from(format!("CLIENT_ERROR {detail}\r\n").into_bytes()));
                self.set_state(ConnState::Write);
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, dispatch: Dispatch<'_>, h: &Handlers<'_>) {
        match dispatch {
            Dispatch::Get { bget: _, keys } => {
                for key in keys.iter() {
                    match h.store.get(key) {
                        Some(item) => {
                            h.stats.record_get(true);
                            let header = format!("VALUE {} {} {}\r\n", String::from_utf8_lossy(key), item.flags, item.value.len());
                            self.reply.add_iov(Bytes::from(header.into_bytes()), true);
                            self.reply.add_iov(item.value, false);
                            self.reply.add_iov(Bytes::from_static(b"\r\n"), false);
                        }
                        None => h.stats.record_get(false),
                    }
                }
                self.reply.add_iov(Bytes::from_static(b"END\r\n"), false);
                self.set_state(ConnState::Write);
            }
            Dispatch::MetaGet { key } => {
                match h.store.get(key) {
                    Some(item) => {
                        let line = format!("META {} flags={} len={}\r\n", String::from_utf8_lossy(key), item.flags, item.value.len());
                        self.queue_line_reply(Bytes::from(line.into_bytes()));
                    }
                    None => self.queue_line_reply(Bytes::from_static(b"END\r\n")),
                }
                self.set_state(ConnState::Write);
            }
            Dispatch::BeginStore(spec) => {
                if spec.len > MAX_VALUE_LEN {
                    self.reply_after_swallow = Some(Bytes::from_static(b"SERVER_ERROR object too large for cache\r\n"));
                    self.swallow_remaining = spec.len + 2;
                    self.set_state(ConnState::Swallow);
                    return;
                }
                self.pending_store = Some(PendingPayload { spec, data: Vec::new() });
                self.set_state(ConnState::NRead);
            }
            Dispatch::Incr { key, delta, noreply } => {
                let outcome = h.store.arithmetic(key, delta, true);
                self.reply_arith(outcome, true, noreply, h);
            }
            Dispatch::Decr { key, delta, noreply } => {
                let outcome = h.store.arithmetic(key, delta, false);
                self.reply_arith(outcome, false, noreply, h);
            }
            Dispatch::Delete { key, grace, noreply } => {
                let hit = match grace {
                    None | Some(0) => h.store.unlink(key),
                    Some(secs) => {
                        let marked = h.store.mark_deleted(key);
                        if marked {
                            h.deferred.lock().unwrap().push(key.to_vec(), secs, wireline_time::current());
                        }
                        marked
                    }
                };
                h.stats.record_delete(hit);
                if !noreply {
                    self.queue_line_reply(if hit { Bytes::from_static(b"DELETED\r\n") } else { Bytes::from_static(b"NOT_FOUND\r\n") });
                    self.set_state(ConnState::Write);
                }
            }
            Dispatch::FlushAll { delay, noreply } => {
                let now = wireline_time::current();
                let deadline = match delay {
                    None => now,
                    Some(d) => wireline_time::realtime(d),
                };
                h.store.flush_before(deadline);
                h.stats.record_flush();
                if !noreply {
                    self.queue_line_reply(Bytes::from_static(b"OK\r\n"));
                    self.set_state(ConnState::Write);
                }
            }
            Dispatch::FlushRegex { pattern } => {
                match std::str::from_utf8(pattern).ok().and_then(|p| regex::bytes::Regex::new(p).ok()) {
                    Some(re) => {
                        let n = h.store.flush_matching(&re);
                        self.queue_line_reply(Bytes::from(format!("OK {n}\r\n").into_bytes()));
                    }
                    None => self.queue_line_reply(Bytes::from_static(b"CLIENT_ERROR invalid regex\r\n")),
                }
                self.set_state(ConnState::Write);
            }
            Dispatch::Stats { sub } => {
                self.reply_stats(sub, h);
                self.set_state(ConnState::Write);
            }
            Dispatch::Verbosity { level, noreply } => {
                h.registry.set_verbosity(level);
                if !noreply {
                    self.queue_line_reply(Bytes::from_static(b"OK\r\n"));
                    self.set_state(ConnState::Write);
                }
            }
            Dispatch::Version => {
                self.queue_line_reply(Bytes::from(format!("VERSION {}\r\n", h.version).into_bytes()));
                self.set_state(ConnState::Write);
            }
            Dispatch::Quit => {
                self.set_state(ConnState::Closing);
            }
            Dispatch::Own { bucket, generation } => {
                let ok = h.buckets.is_some_and(|b| b.own(bucket, generation));
                self.queue_line_reply(if ok { Bytes::from_static(b"OWNED\r\n") } else { Bytes::from_static(b"ERROR_NOT_OWNER\r\n") });
                self.set_state(ConnState::Write);
            }
            Dispatch::Disown { bucket } => {
                let ok = h.buckets.is_some_and(|b| b.disown(bucket));
                self.queue_line_reply(if ok { Bytes::from_static(b"DISOWNED\r\n") } else { Bytes::from_static(b"ERROR_NOT_OWNER\r\n") });
                self.set_state(ConnState::Write);
            }
            Dispatch::Bg { bucket, generation } => {
                let ok = h.buckets.is_some_and(|b| b.bump_generation(bucket, generation));
                self.queue_line_reply(if ok { Bytes::from_static(b"OK\r\n") } else { Bytes::from_static(b"ERROR_NOT_OWNER\r\n") });
                self.set_state(ConnState::Write);
            }
        }
    }

    fn reply_arith(&mut self, outcome: Result<u64, ArithError>, is_incr: bool, noreply: bool, h: &Handlers<'_>) {
        let hit = !matches!(outcome, Err(ArithError::NotFound));
        if is_incr {
            h.stats.record_incr(hit);
        } else {
            h.stats.record_decr(hit);
        }
        if noreply {
            return;
        }
        match outcome {
            Ok(value) => self.queue_line_reply(Bytes::from(format!("{value}\r\n").into_bytes())),
            Err(ArithError::NotFound) => self.queue_line_reply(Bytes::from_static(b"NOT_FOUND\r\n")),
            Err(ArithError::NonNumeric) => {
                self.queue_line_reply(Bytes::from_static(b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"));
            }
        }
        self.set_state(ConnState::Write);
    }

    /// `stats` and its named subcommands (SPEC_FULL.md §4.K). Only `reset`
    /// and `conn_buffer` carry real per-process meaning in this design; the
    /// slab/allocator-facing subcommands (`malloc`, `maps`, `sizes`,
    /// `slabs`, `cachedump`, `detail`, `cost-benefit`) describe a slab
    /// allocator this store doesn't have (SPEC_FULL.md §4.J Non-goals), so
    /// they reply with an empty `END` the way a server with nothing to
    /// report for that subsystem would, rather than inventing fake numbers.
    fn reply_stats(&mut self, sub: Option<&[u8]>, h: &Handlers<'_>) {
        match sub {
            None => self.reply_stats_general(h),
            Some(b"reset") => {
                h.registry.reset();
                self.queue_line_reply(Bytes::from_static(b"RESET\r\n"));
            }
            Some(b"conn_buffer") => {
                let line = format!("STAT conn_buffer {}\r\nEND\r\n", h.buffer_pool.group_stats());
                self.queue_line_reply(Bytes::from(line.into_bytes()));
            }
            Some(b"buckets") => {
                let line = match h.buckets {
                    Some(buckets) => format!("STAT buckets {}\r\nEND\r\n", buckets.len()),
                    None => "END\r\n".to_owned(),
                };
                self.queue_line_reply(Bytes::from(line.into_bytes()));
            }
            Some(_) => self.queue_line_reply(Bytes::from_static(b"END\r\n")),
        }
    }

    fn reply_stats_general(&mut self, h: &Handlers<'_>) {
        let totals = h.registry.snapshot();
        let store_stats = h.store.stats();
        let mut out = String::new();
        out.push_str(&format!("STAT pid {}\r\n", totals.pid));
        out.push_str(&format!("STAT uptime {}\r\n", totals.uptime));
        out.push_str(&format!("STAT curr_connections {}\r\n", totals.curr_connections));
        out.push_str(&format!("STAT total_connections {}\r\n", totals.total_connections));
        out.push_str(&format!("STAT cmd_get {}\r\n", totals.cmd_get));
        out.push_str(&format!("STAT cmd_set {}\r\n", totals.cmd_set));
        out.push_str(&format!("STAT cmd_delete {}\r\n", totals.cmd_delete));
        out.push_str(&format!("STAT cmd_flush {}\r\n", totals.cmd_flush));
        out.push_str(&format!("STAT get_hits {}\r\n", totals.get_hits));
        out.push_str(&format!("STAT get_misses {}\r\n", totals.get_misses));
        out.push_str(&format!("STAT bytes_read {}\r\n", totals.bytes_read));
        out.push_str(&format!("STAT bytes_written {}\r\n", totals.bytes_written));
        out.push_str(&format!("STAT curr_items {}\r\n", store_stats.items));
        out.push_str(&format!("STAT bytes {}\r\n", store_stats.bytes));
        out.push_str(&format!("STAT evictions {}\r\n", store_stats.evictions));
        out.push_str(&format!("STAT expired_unfetched {}\r\n", store_stats.expired_unfetched));
        out.push_str("END\r\n");
        self.queue_line_reply(Bytes::from(out.into_bytes()));
    }

    fn advance_nread(&mut self, saw_readable: bool, h: &Handlers<'_>) {
        let Some(pending) = self.pending_store.as_mut() else {
            self.set_state(ConnState::Reading);
            return;
        };
        let need = pending.spec.len + 2;

        // Drain whatever's already buffered before touching the socket.
        if pending.data.len() < need && self.read_pos < self.read_end {
            let available = self.read_end - self.read_pos;
            let take = available.min(need - pending.data.len());
            pending.data.extend_from_slice(&self.read_buf[self.read_pos..self.read_pos + take]);
            self.read_pos += take;
        }

        let pending = self.pending_store.as_ref().expect("checked above");
        if pending.data.len() < need {
            if !saw_readable {
                return;
            }
            let mut chunk = [0u8; READ_GROW_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => self.set_state(ConnState::Closing),
                Ok(n) => {
                    self.stats.add_bytes_read(n as u64);
                    let pending = self.pending_store.as_mut().expect("checked above");
                    let take = n.min(need - pending.data.len());
                    pending.data.extend_from_slice(&chunk[..take]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "connection: nread failed");
                    self.set_state(ConnState::Closing);
                }
            }
            return;
        }

        self.complete_store(h);
    }

    fn complete_store(&mut self, h: &Handlers<'_>) {
        let pending = self.pending_store.take().expect("nread complete implies pending");
        let well_formed = pending.data.ends_with(b"\r\n");
        if !well_formed {
            if !pending.spec.noreply {
                self.queue_line_reply(Bytes::from_static(b"CLIENT_ERROR bad data chunk\r\n"));
                self.set_state(ConnState::Write);
            } else {
                self.set_state(ConnState::Reading);
            }
            return;
        }
        let value = Bytes::copy_from_slice(&pending.data[..pending.data.len() - 2]);
        let outcome = h.store.store(&pending.spec.key, pending.spec.flags, pending.spec.exptime, value, pending.spec.policy);
        h.stats.record_set();
        if pending.spec.noreply {
            self.set_state(ConnState::Reading);
            return;
        }
        self.queue_line_reply(match outcome {
            StoreOutcome::Stored => Bytes::from_static(b"STORED\r\n"),
            StoreOutcome::NotStored => Bytes::from_static(b"NOT_STORED\r\n"),
        });
        self.set_state(ConnState::Write);
    }

    fn advance_swallow(&mut self, saw_readable: bool) {
        if self.swallow_remaining == 0 {
            if let Some(text) = self.reply_after_swallow.take() {
                self.queue_line_reply(text);
                self.set_state(ConnState::Write);
            } else {
                self.set_state(ConnState::Reading);
            }
            return;
        }
        if self.read_pos < self.read_end {
            let available = self.read_end - self.read_pos;
            let take = available.min(self.swallow_remaining);
            self.read_pos += take;
            self.swallow_remaining -= take;
            return;
        }
        if !saw_readable {
            return;
        }
        let mut chunk = [0u8; READ_GROW_CHUNK];
        let want = chunk.len().min(self.swallow_remaining);
        match self.stream.read(&mut chunk[..want]) {
            Ok(0) => self.set_state(ConnState::Closing),
            Ok(n) => self.swallow_remaining -= n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(?err, "connection: swallow read failed");
                self.set_state(ConnState::Closing);
            }
        }
    }

    /// Deregisters the socket and releases any reply state still pinning
    /// item bytes. Called by the worker once `drive` returns `Closed`.
    pub fn close(&mut self, registry: &Registry) {
        self.reply.clear();
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.stats.connection_closed();
    }

    /// Hands the read buffer back to the caller (normally the worker's
    /// [`crate::buffer_pool::BufferPool`]) along with the high-water mark it
    /// reached, so the pool can decide whether to recycle or drop it. Called
    /// once, after [`Connection::close`].
    pub fn take_read_buf(&mut self) -> (Vec<u8>, usize) {
        (std::mem::take(&mut self.read_buf), self.read_high_water)
    }
}

enum FillOutcome {
    Filled,
    WouldBlock,
    Eof,
    Err,
}
