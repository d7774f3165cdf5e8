//! Scatter/gather reply assembly, including UDP datagram framing.
//!
//! A response is built as a queue of messages, each a sequence of `Bytes`
//! segments. For a stream connection there is usually exactly one message;
//! it only splits further if a single response would need more segments
//! than [`IOV_MAX`]. For a datagram connection, [`add_iov`] also splits
//! whenever appending would push a message past [`UDP_MAX_PAYLOAD_SIZE`],
//! so one logical reply can fragment across several outgoing datagrams.
//!
//! Holding a stored item's bytes alive for as long as a segment references
//! them is just `Bytes`'s ordinary refcounting — there is no separate
//! pinned-reference bookkeeping here, unlike a representation built on raw
//! pointers into a slab allocator.

use std::{
    collections::VecDeque,
    io::{self, IoSlice, Write},
    net::SocketAddr,
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Segments per message before a new one is opened, independent of any
/// datagram size limit. Conservative relative to typical platform `IOV_MAX`
/// (1024) so a pathological multi-get can't blow a syscall's iovec limit.
pub const IOV_MAX: usize = 256;

/// Conservative below common path MTUs so replies don't need IP
/// fragmentation on typical networks.
pub const UDP_MAX_PAYLOAD_SIZE: usize = 1400;

pub(crate) const UDP_HEADER_LEN: usize = 8;

struct Segment {
    bytes: Bytes,
    offset: usize,
}

struct MessageHeader {
    segments: Vec<Segment>,
    total_len: usize,
    /// Byte offset, within the body (excluding the UDP header if any), of
    /// the first segment added with `is_start = true`.
    response_start: Option<usize>,
}

impl MessageHeader {
    fn new(is_datagram: bool) -> Self {
        if is_datagram {
            let placeholder = Segment { bytes: Bytes::from_static(&[0u8; UDP_HEADER_LEN]), offset: 0 };
            Self { segments: vec![placeholder], total_len: UDP_HEADER_LEN, response_start: None }
        } else {
            Self { segments: Vec::new(), total_len: 0, response_start: None }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// Every queued message has been fully sent.
    Complete,
    /// Some bytes remain queued; caller should arm writable interest.
    Incomplete,
    /// Would block on the very first attempt: same handling as `Incomplete`
    /// but distinguished for callers that only want to arm once.
    SoftError,
    /// Unrecoverable I/O error; connection must close.
    HardError,
}

/// Per-connection reply queue; one instance lives inside each connection
/// object and is driven by the `write`/`mwrite` states.
pub struct ReplyAssembler {
    messages: VecDeque<MessageHeader>,
    is_datagram: bool,
}

impl ReplyAssembler {
    #[must_use]
    pub fn new(is_datagram: bool) -> Self {
        Self { messages: VecDeque::new(), is_datagram }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Appends a new, empty message, reserving the 8-byte UDP header slot up
    /// front for datagram connections.
    pub fn add_msghdr(&mut self) {
        self.messages.push_back(MessageHeader::new(self.is_datagram));
    }

    /// Appends one data segment, opening new messages as needed to respect
    /// the IOV cap and, for datagram connections, the payload size limit.
    /// `is_start` marks the first byte of a top-level response line, used
    /// later to fill in the UDP header's offset field.
    pub fn add_iov(&mut self, mut data: Bytes, is_start: bool) {
        if self.messages.is_empty() {
            self.add_msghdr();
        }
        while !data.is_empty() {
            let msg = self.messages.back_mut().expect("just ensured non-empty");
            let room = if self.is_datagram { UDP_MAX_PAYLOAD_SIZE.saturating_sub(msg.total_len) } else { usize::MAX };
            if msg.segments.len() >= IOV_MAX || (self.is_datagram && room == 0) {
                self.add_msghdr();
                continue;
            }
            let take = data.len().min(room);
            let head = data.split_to(take);
            let msg = self.messages.back_mut().expect("just ensured non-empty");
            if is_start && msg.response_start.is_none() {
                let header_len = if self.is_datagram { UDP_HEADER_LEN } else { 0 };
                msg.response_start = Some(msg.total_len - header_len);
            }
            msg.total_len += head.len();
            msg.segments.push(Segment { bytes: head, offset: 0 });
        }
    }

    /// Fills in every queued message's 8-byte UDP header: request id, this
    /// message's index, total message count, and the response-start offset
    /// (or 0 if none was marked). No-op for stream connections.
    pub fn build_udp_headers(&mut self, request_id: u16) {
        if !self.is_datagram {
            return;
        }
        let total = self.messages.len() as u16;
        for (idx, msg) in self.messages.iter_mut().enumerate() {
            let mut header = [0u8; UDP_HEADER_LEN];
            header[0..2].copy_from_slice(&request_id.to_be_bytes());
            header[2..4].copy_from_slice(&(idx as u16).to_be_bytes());
            header[4..6].copy_from_slice(&total.to_be_bytes());
            let offset = msg.response_start.unwrap_or(0) as u16;
            header[6..8].copy_from_slice(&offset.to_be_bytes());
            if let Some(first) = msg.segments.first_mut() {
                first.bytes = Bytes::copy_from_slice(&header);
            }
        }
    }

    /// Drops every queued message and segment, releasing any pinned item
    /// bytes. Called when a connection is abandoned mid-reply (hard error,
    /// close).
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Drains queued messages over a stream socket via vectored writes,
    /// advancing through partially written segments on a short write.
    pub fn transmit_stream<W: Write>(&mut self, stream: &mut W) -> TransmitOutcome {
        while let Some(msg) = self.messages.front_mut() {
            if msg.segments.is_empty() {
                self.messages.pop_front();
                continue;
            }
            wireline_util::safe_assert!(msg.segments.len() <= IOV_MAX, "reply message exceeded IOV_MAX ({} segments)", msg.segments.len());
            let slices: Vec<IoSlice<'_>> =
                msg.segments.iter().map(|s| IoSlice::new(&s.bytes[s.offset..])).collect();
            match stream.write_vectored(&slices) {
                Ok(0) => {
                    warn!("reply: write_vectored returned 0, treating as hard error");
                    return TransmitOutcome::HardError;
                }
                Ok(mut n) => {
                    drop(slices);
                    let segs = &mut msg.segments;
                    while n > 0 && !segs.is_empty() {
                        let remaining = segs[0].bytes.len() - segs[0].offset;
                        if n >= remaining {
                            n -= remaining;
                            segs.remove(0);
                        } else {
                            segs[0].offset += n;
                            n = 0;
                        }
                    }
                    if segs.is_empty() {
                        self.messages.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TransmitOutcome::SoftError,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "reply: stream write failed");
                    return TransmitOutcome::HardError;
                }
            }
        }
        TransmitOutcome::Complete
    }

    /// Sends queued datagrams one at a time. UDP writes are atomic, so
    /// there's no partial-message bookkeeping: either the whole datagram
    /// goes out or it doesn't. `scratch` is reused across calls to avoid
    /// allocating on every send.
    pub fn transmit_datagram(
        &mut self,
        socket: &mio::net::UdpSocket,
        peer: SocketAddr,
        scratch: &mut BytesMut,
    ) -> TransmitOutcome {
        while let Some(msg) = self.messages.front() {
            scratch.clear();
            for seg in &msg.segments {
                scratch.extend_from_slice(&seg.bytes[seg.offset..]);
            }
            match socket.send_to(scratch, peer) {
                Ok(_) => {
                    self.messages.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TransmitOutcome::SoftError,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, peer = ?peer, "reply: datagram send failed, dropping");
                    return TransmitOutcome::HardError;
                }
            }
        }
        TransmitOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_small_reply_is_one_message() {
        let mut r = ReplyAssembler::new(false);
        r.add_msghdr();
        r.add_iov(Bytes::from_static(b"VALUE a 0 1\r\n"), true);
        r.add_iov(Bytes::from_static(b"1\r\n"), false);
        r.add_iov(Bytes::from_static(b"END\r\n"), false);
        assert_eq!(r.message_count(), 1);
    }

    #[test]
    fn datagram_payload_fragments_across_messages() {
        let mut r = ReplyAssembler::new(true);
        r.add_msghdr();
        let chunk = Bytes::from(vec![b'x'; 1000]);
        for _ in 0..4 {
            r.add_iov(chunk.clone(), false);
        }
        assert!(r.message_count() >= 3);
    }

    #[test]
    fn udp_headers_carry_sequence_and_count() {
        let mut r = ReplyAssembler::new(true);
        r.add_msghdr();
        r.add_iov(Bytes::from_static(b"END\r\n"), true);
        r.build_udp_headers(7);
        assert_eq!(r.message_count(), 1);
    }
}
