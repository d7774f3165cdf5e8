//! One worker thread: owns a private `mio::Poll`, all connections handed to
//! it by the dispatcher, and (if UDP is enabled) its own UDP socket. Per
//! SPEC_FULL.md §5, a connection never migrates between workers once
//! dispatched, and all I/O for it happens on this one thread.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
    },
    time::Duration,
};

use bytes::BytesMut;
use mio::{Events, Interest, Poll, Token, Waker, net::UdpSocket};
use tracing::debug;
use wireline_core::{
    BufferPool, Connection, ConnOutcome, Handlers, Transport,
    deferred_delete::DeferredDeleteQueue,
    managed::BucketTable,
    udp::{self, UdpHandlers},
};
use wireline_stats::{StatsRegistry, ThreadStats};
use wireline_store::Store;

const WAKER_TOKEN: Token = Token(0);
const UDP_TOKEN: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

/// A freshly accepted socket, handed from the dispatcher to a worker over
/// its inbox channel.
pub enum Incoming {
    Tcp(mio::net::TcpStream, SocketAddr),
    Unix(mio::net::UnixStream),
}

pub struct WorkerShared {
    pub store: Arc<Store>,
    pub stats_registry: Arc<StatsRegistry>,
    pub deferred: Arc<Mutex<DeferredDeleteQueue>>,
    pub buckets: Option<Arc<BucketTable>>,
    pub version: &'static str,
    pub reqs_per_event: u32,
    pub stop: Arc<AtomicBool>,
    /// This worker's share of the `-C` total conn-buffer-bytes budget,
    /// already divided across the worker pool.
    pub conn_buffer_cap: usize,
}

pub struct Worker {
    poll: Poll,
    waker: Arc<Waker>,
    inbox: Receiver<Incoming>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    udp_socket: Option<UdpSocket>,
    udp_scratch: BytesMut,
    shared: WorkerShared,
    thread_stats: Arc<ThreadStats>,
    buffer_pool: BufferPool,
}

impl Worker {
    pub fn new(inbox: Receiver<Incoming>, udp_socket: Option<UdpSocket>, shared: WorkerShared) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let thread_stats = shared.stats_registry.register();
        let buffer_pool = BufferPool::new((shared.conn_buffer_cap / wireline_core::buffer_pool::PAGE_SIZE).max(8));
        let mut worker = Self {
            poll,
            waker,
            inbox,
            connections: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            udp_socket,
            udp_scratch: BytesMut::with_capacity(2048),
            shared,
            thread_stats,
            buffer_pool,
        };
        if let Some(socket) = worker.udp_socket.as_mut() {
            worker.poll.registry().register(socket, UDP_TOKEN, Interest::READABLE)?;
        }
        Ok(worker)
    }

    /// A clone of this worker's waker, given to the dispatcher so it can
    /// nudge the worker's `poll` loop the moment it hands over a new
    /// connection instead of waiting for the next timeout tick.
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(Duration::from_millis(250))) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                debug!(?err, "worker: poll failed");
                continue;
            }
            if self.shared.stop.load(Ordering::Relaxed) {
                return;
            }
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.drain_inbox(),
                    UDP_TOKEN => self.drain_udp(),
                    token => self.drive_connection(token, event.is_readable(), event.is_writable()),
                }
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(incoming) = self.inbox.try_recv() {
            let token = self.next_token();
            let (transport, peer): (Transport, String) = match incoming {
                Incoming::Tcp(stream, addr) => {
                    let _ = stream.set_nodelay(true);
                    (Transport::Tcp(stream), addr.to_string())
                }
                Incoming::Unix(stream) => (Transport::Unix(stream), "unix".to_owned()),
            };
            let read_buf = self.buffer_pool.acquire();
            let mut conn = Connection::new(token, transport, peer, Arc::clone(&self.thread_stats), read_buf);
            if let Err(err) = conn.register(self.poll.registry()) {
                debug!(?err, "worker: failed to register accepted connection");
                continue;
            }
            self.connections.insert(token, conn);
        }
    }

    fn drain_udp(&mut self) {
        let Some(socket) = self.udp_socket.as_ref() else { return };
        let handlers = UdpHandlers {
            store: &self.shared.store,
            stats: &self.thread_stats,
            deferred: &self.shared.deferred,
            buckets: self.shared.buckets.as_deref(),
            registry: &self.shared.stats_registry,
            version: self.shared.version,
        };
        udp::drain_readable(socket, &handlers, &mut self.udp_scratch);
    }

    fn drive_connection(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            wireline_util::safe_panic!("poll event for unknown connection token {token:?}");
            return;
        };
        let handlers = Handlers {
            store: &self.shared.store,
            stats: &self.thread_stats,
            deferred: &self.shared.deferred,
            buckets: self.shared.buckets.as_deref(),
            registry: &self.shared.stats_registry,
            version: self.shared.version,
            buffer_pool: &self.buffer_pool,
        };
        let outcome = conn.drive(self.poll.registry(), readable, writable, &handlers, self.shared.reqs_per_event);
        if matches!(outcome, ConnOutcome::Closed) {
            if let Some(mut conn) = self.connections.remove(&token) {
                conn.close(self.poll.registry());
                let (buf, high_water) = conn.take_read_buf();
                self.buffer_pool.release(buf, high_water);
            }
        }
    }
}
