//! Listener/acceptor (SPEC_FULL.md §4.I). One dispatcher owns the listening
//! socket, accepts connections, and round-robins each to a worker's inbox
//! channel, waking that worker's `poll` loop so the new connection is
//! registered promptly instead of waiting for the next timeout tick.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    time::Duration,
};

use mio::{
    Events, Interest, Poll, Token, Waker,
    net::{TcpListener, TcpStream, UnixListener},
};
use socket2::SockRef;
use tracing::{debug, info, warn};
use wireline_stats::StatsRegistry;

use crate::worker::Incoming;

const LISTENER_TOKEN: Token = Token(0);

/// Best-effort socket tuning on a freshly accepted TCP stream: enable
/// keepalive probes so a peer that vanishes without a `FIN` is eventually
/// noticed, and set `SO_LINGER` to zero so a worker closing a connection
/// doesn't block the reactor thread waiting to drain a dead peer's queue.
fn tune_accepted_socket(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    if let Err(err) = sock.set_keepalive(true) {
        debug!(?err, "dispatcher: failed to enable SO_KEEPALIVE");
    }
    if let Err(err) = sock.set_linger(Some(Duration::from_secs(0))) {
        debug!(?err, "dispatcher: failed to set SO_LINGER");
    }
}

pub struct WorkerHandle {
    pub sender: Sender<Incoming>,
    pub waker: Arc<Waker>,
}

/// Hands `incoming` to the next worker in round-robin order and wakes it.
/// A full or disconnected inbox just drops the connection, logged — the
/// same "no slot available" outcome a `-c`-bounded accept would produce.
fn dispatch_round_robin(workers: &[WorkerHandle], next: &mut usize, incoming: Incoming) {
    let handle = &workers[*next];
    *next = (*next + 1) % workers.len();
    if handle.sender.send(incoming).is_err() {
        warn!("dispatcher: worker inbox closed, dropping connection");
        return;
    }
    if let Err(err) = handle.waker.wake() {
        debug!(?err, "dispatcher: failed to wake worker");
    }
}

/// `-c`-style backpressure: while the summed `curr_connections` across every
/// worker is at or above the configured ceiling, the dispatcher stops
/// accepting (rather than trying to detect `EMFILE` directly, which is
/// moot once the soft ceiling is enforced first). See SPEC_FULL.md's
/// `EMFILE`-backpressure note in §4.I/§5.
fn at_connection_ceiling(stats: &StatsRegistry, max_connections: u32) -> bool {
    stats.snapshot().curr_connections as u32 >= max_connections
}

pub fn run_tcp(
    addr: SocketAddr,
    workers: Vec<WorkerHandle>,
    stats: Arc<StatsRegistry>,
    max_connections: u32,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut listener = TcpListener::bind(addr)?;
    let poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    info!(%addr, "dispatcher: listening for TCP connections");

    let mut events = Events::with_capacity(64);
    let mut next_worker = 0usize;
    loop {
        if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            loop {
                if at_connection_ceiling(&stats, max_connections) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tune_accepted_socket(&stream);
                        dispatch_round_robin(&workers, &mut next_worker, Incoming::Tcp(stream, peer));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, "dispatcher: accept failed");
                        break;
                    }
                }
            }
        }
    }
}

pub fn run_unix(
    path: std::path::PathBuf,
    workers: Vec<WorkerHandle>,
    stats: Arc<StatsRegistry>,
    max_connections: u32,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let _ = std::fs::remove_file(&path);
    let mut listener = UnixListener::bind(&path)?;
    let poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    info!(path = %path.display(), "dispatcher: listening on unix socket");

    let mut events = Events::with_capacity(64);
    let mut next_worker = 0usize;
    let result = loop {
        if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break Err(err);
        }
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            loop {
                if at_connection_ceiling(&stats, max_connections) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => dispatch_round_robin(&workers, &mut next_worker, Incoming::Unix(stream)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, "dispatcher: accept failed");
                        break;
                    }
                }
            }
        }
    };
    let _ = std::fs::remove_file(&path);
    result
}
