//! UDP socket setup and per-datagram request handling.
//!
//! Unlike a TCP [`crate::connection::Connection`], a UDP peer gets no
//! persistent state machine: each datagram already carries a complete
//! request (the wire format rejects anything that would need more than one
//! packet), so a worker reads one datagram, dispatches it synchronously
//! against the store, and attempts exactly one non-blocking reply send. If
//! that reply would need more than one outgoing datagram it is built as a
//! short-lived [`ReplyAssembler`] and each fragment is sent in turn; if any
//! send would block, the remaining fragments are dropped and logged rather
//! than queued, since there is no connection object to hold them.

use std::{io, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use mio::net::UdpSocket;
use tracing::{debug, warn};
use wireline_stats::{StatsRegistry, ThreadStats};
use wireline_store::{ArithError, Store};

use crate::{
    deferred_delete::DeferredDeleteQueue,
    managed::BucketTable,
    protocol::{self, Dispatch, ProtocolError},
    reply::{ReplyAssembler, TransmitOutcome, UDP_HEADER_LEN},
};

/// Largest datagram this server will read; payloads must fit a single
/// packet by design, so this just guards against a malformed oversized
/// read.
const MAX_DATAGRAM: usize = 65_507;

/// Binds a UDP socket with `SO_REUSEPORT` so every worker thread can own an
/// independent socket on the same address, each getting its own share of
/// incoming datagrams from the kernel instead of contending on one.
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<UdpSocket> {
    use std::os::unix::io::FromRawFd;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: a freshly created datagram socket fd, checked for -1 below.
    let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let on: libc::c_int = 1;
    // SAFETY: fd is valid and owned exclusively at this point.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let (sockaddr, len) = socket2_addr(addr);
    // SAFETY: sockaddr/len describe a valid sockaddr_in[6] built from `addr`.
    let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(sockaddr).cast(), len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd hasn't been handed to any owning wrapper yet.
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    // SAFETY: fd is a valid, bound, exclusively-owned datagram socket.
    let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    std_socket.set_nonblocking(true)?;
    maximize_udp_buffers(&std_socket);
    Ok(UdpSocket::from_std(std_socket))
}

/// Grows the kernel send/receive buffers as far as the platform allows, up
/// to a generous ceiling. A burst of datagrams arriving faster than a
/// worker drains them is dropped by the kernel rather than queued once its
/// default (often tiny) buffer fills, so this trades memory for headroom.
fn maximize_udp_buffers(socket: &std::net::UdpSocket) {
    const TARGET: usize = 4 * 1024 * 1024;
    let sock = socket2::SockRef::from(socket);
    if let Err(err) = sock.set_recv_buffer_size(TARGET) {
        debug!(?err, "udp: failed to grow SO_RCVBUF");
    }
    if let Err(err) = sock.set_send_buffer_size(TARGET) {
        debug!(?err, "udp: failed to grow SO_SNDBUF");
    }
}

/// Builds the raw `sockaddr_storage` bytes for `bind(2)`, minimally: enough
/// fields for IPv4/IPv6, matching what `libc::bind` needs and nothing more.
fn socket2_addr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed sockaddr_storage is a valid representation.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits within sockaddr_storage.
            unsafe {
                std::ptr::write(std::ptr::addr_of_mut!(storage).cast(), sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits within sockaddr_storage.
            unsafe {
                std::ptr::write(std::ptr::addr_of_mut!(storage).cast(), sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Everything a UDP dispatch needs, mirroring [`crate::connection::Handlers`]
/// but without anything connection-state-shaped.
pub struct UdpHandlers<'a> {
    pub store: &'a Store,
    pub stats: &'a ThreadStats,
    pub deferred: &'a std::sync::Mutex<DeferredDeleteQueue>,
    pub buckets: Option<&'a BucketTable>,
    pub registry: &'a StatsRegistry,
    pub version: &'static str,
}

/// Drains every datagram currently available on `socket`, processing each
/// to completion before returning. `scratch` is reused across calls.
pub fn drain_readable(socket: &UdpSocket, h: &UdpHandlers<'_>, scratch: &mut BytesMut) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => handle_datagram(socket, &buf[..n], peer, h, scratch),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(?err, "udp: recv_from failed");
                return;
            }
        }
    }
}

fn handle_datagram(socket: &UdpSocket, datagram: &[u8], peer: SocketAddr, h: &UdpHandlers<'_>, scratch: &mut BytesMut) {
    if datagram.len() < UDP_HEADER_LEN {
        warn!(?peer, "udp: datagram shorter than header, dropping");
        return;
    }
    let request_id = u16::from_be_bytes([datagram[0], datagram[1]]);
    let msg_index = u16::from_be_bytes([datagram[2], datagram[3]]);
    let msg_count = u16::from_be_bytes([datagram[4], datagram[5]]);
    let body = &datagram[UDP_HEADER_LEN..];

    let mut reply = ReplyAssembler::new(true);
    if msg_index != 0 || msg_count != 1 {
        reply.add_iov(Bytes::from_static(b"SERVER_ERROR multi-packet request not supported\r\n"), true);
        reply.build_udp_headers(request_id);
        send_reply(socket, &mut reply, peer, scratch);
        return;
    }

    let Some(line_end) = body.iter().position(|&b| b == b'\n') else {
        reply.add_iov(Bytes::from_static(b"ERROR\r\n"), true);
        reply.build_udp_headers(request_id);
        send_reply(socket, &mut reply, peer, scratch);
        return;
    };
    let mut line_len = line_end;
    if line_len > 0 && body[line_len - 1] == b'\r' {
        line_len -= 1;
    }
    let line = &body[..line_len];

    match protocol::parse(line) {
        Ok(None) => {}
        Ok(Some(dispatch)) => dispatch_one(dispatch, h, &mut reply),
        Err(ProtocolError::UnknownCommand) => reply.add_iov(Bytes::from_static(b"ERROR\r\n"), true),
        Err(ProtocolError::ClientError(detail)) => {
            reply.add_iov(Bytes::from(format!("CLIENT_ERROR {detail}\r\n").into_bytes()), true);
        }
    }
    if reply.is_empty() {
        return;
    }
    reply.build_udp_headers(request_id);
    send_reply(socket, &mut reply, peer, scratch);
}

fn send_reply(socket: &UdpSocket, reply: &mut ReplyAssembler, peer: SocketAddr, scratch: &mut BytesMut) {
    match reply.transmit_datagram(socket, peer, scratch) {
        TransmitOutcome::Complete => {}
        TransmitOutcome::Incomplete | TransmitOutcome::SoftError => {
            debug!(?peer, "udp: reply send would block, dropping remaining fragments");
        }
        TransmitOutcome::HardError => {
            warn!(?peer, "udp: reply send failed, dropping");
        }
    }
}

/// A store-family command over UDP completes inline: `add`/`set`/`replace`
/// carry their payload in the same datagram as the command line, so there
/// is no `nread` suspension to model.
fn dispatch_one(dispatch: Dispatch<'_>, h: &UdpHandlers<'_>, reply: &mut ReplyAssembler) {
    match dispatch {
        Dispatch::Get { bget: _, keys } => {
            for key in keys.iter() {
                match h.store.get(key) {
                    Some(item) => {
                        h.stats.record_get(true);
                        let header = format!("VALUE {} {} {}\r\n", String::from_utf8_lossy(key), item.flags, item.value.len());
                        reply.add_iov(Bytes::from(header.into_bytes()), true);
                        reply.add_iov(item.value, false);
                        reply.add_iov(Bytes::from_static(b"\r\n"), false);
                    }
                    None => h.stats.record_get(false),
                }
            }
            reply.add_iov(Bytes::from_static(b"END\r\n"), false);
        }
        Dispatch::MetaGet { key } => match h.store.get(key) {
            Some(item) => {
                let line = format!("META {} flags={} len={}\r\n", String::from_utf8_lossy(key), item.flags, item.value.len());
                reply.add_iov(Bytes::from(line.into_bytes()), true);
            }
            None => reply.add_iov(Bytes::from_static(b"END\r\n"), true),
        },
        Dispatch::BeginStore(_) => {
            // A datagram large enough to need `nread` would already have
            // failed the single-packet check above; this command reaches
            // here only with its full value already in the datagram, which
            // the protocol layer's single-call tier can't express, so
            // stores over UDP are rejected rather than silently accepted
            // half-read.
            reply.add_iov(Bytes::from_static(b"SERVER_ERROR store over UDP not supported\r\n"), true);
        }
        Dispatch::Incr { key, delta, noreply } => {
            let outcome = h.store.arithmetic(key, delta, true);
            h.stats.record_incr(!matches!(outcome, Err(ArithError::NotFound)));
            if !noreply {
                reply_arith(reply, outcome);
            }
        }
        Dispatch::Decr { key, delta, noreply } => {
            let outcome = h.store.arithmetic(key, delta, false);
            h.stats.record_decr(!matches!(outcome, Err(ArithError::NotFound)));
            if !noreply {
                reply_arith(reply, outcome);
            }
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
                reply.add_iov(if hit { Bytes::from_static(b"DELETED\r\n") } else { Bytes::from_static(b"NOT_FOUND\r\n") }, true);
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
                reply.add_iov(Bytes::from_static(b"OK\r\n"), true);
            }
        }
        Dispatch::FlushRegex { pattern } => {
            match std::str::from_utf8(pattern).ok().and_then(|p| regex::bytes::Regex::new(p).ok()) {
                Some(re) => {
                    let n = h.store.flush_matching(&re);
                    reply.add_iov(Bytes::from(format!("OK {n}\r\n").into_bytes()), true);
                }
                None => reply.add_iov(Bytes::from_static(b"CLIENT_ERROR invalid regex\r\n"), true),
            }
        }
        Dispatch::Stats { sub } => {
            if sub == Some(b"reset") {
                h.registry.reset();
                reply.add_iov(Bytes::from_static(b"RESET\r\n"), true);
            } else {
                let totals = h.registry.snapshot();
                let store_stats = h.store.stats();
                let out = format!(
                    "STAT pid {}\r\nSTAT uptime {}\r\nSTAT curr_items {}\r\nSTAT bytes {}\r\nEND\r\n",
                    totals.pid, totals.uptime, store_stats.items, store_stats.bytes
                );
                reply.add_iov(Bytes::from(out.into_bytes()), true);
            }
        }
        Dispatch::Verbosity { level, noreply } => {
            h.registry.set_verbosity(level);
            if !noreply {
                reply.add_iov(Bytes::from_static(b"OK\r\n"), true);
            }
        }
        Dispatch::Version => reply.add_iov(Bytes::from(format!("VERSION {}\r\n", h.version).into_bytes()), true),
        Dispatch::Quit => {}
        Dispatch::Own { bucket, generation } => {
            let ok = h.buckets.is_some_and(|b| b.own(bucket, generation));
            reply.add_iov(if ok { Bytes::from_static(b"OWNED\r\n") } else { Bytes::from_static(b"ERROR_NOT_OWNER\r\n") }, true);
        }
        Dispatch::Disown { bucket } => {
            let ok = h.buckets.is_some_and(|b| b.disown(bucket));
            reply.add_iov(if ok { Bytes::from_static(b"DISOWNED\r\n") } else { Bytes::from_static(b"ERROR_NOT_OWNER\r\n") }, true);
        }
        Dispatch::Bg { bucket, generation } => {
            let ok = h.buckets.is_some_and(|b| b.bump_generation(bucket, generation));
            reply.add_iov(if ok { Bytes::from_static(b"OK\r\n") } else { Bytes::from_static(b"ERROR_NOT_OWNER\r\n") }, true);
        }
    }
}

fn reply_arith(reply: &mut ReplyAssembler, outcome: Result<u64, ArithError>) {
    match outcome {
        Ok(value) => reply.add_iov(Bytes::from(format!("{value}\r\n").into_bytes()), true),
        Err(ArithError::NotFound) => reply.add_iov(Bytes::from_static(b"NOT_FOUND\r\n"), true),
        Err(ArithError::NonNumeric) => {
            reply.add_iov(Bytes::from_static(b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"), true);
        }
    }
}
