//! The per-connection protocol engine: the non-blocking network layer, the
//! per-connection state machine, the command parser and dispatcher, the
//! vectored-I/O reply assembler (including UDP datagram framing), and the
//! deferred-delete lifecycle.
//!
//! Everything this crate depends on for the actual item storage, worker
//! stats, and coarse time lives in narrower collaborator crates
//! (`wireline-store`, `wireline-stats`, `wireline-time`) so this crate's own
//! surface stays limited to the reactor-facing pieces described in
//! SPEC_FULL.md §4.

pub mod buffer_pool;
pub mod connection;
pub mod deferred_delete;
pub mod managed;
pub mod protocol;
pub mod reply;
pub mod transport;
pub mod udp;

pub use buffer_pool::BufferPool;
pub use connection::{ConnOutcome, ConnState, Connection, Handlers};
pub use reply::{ReplyAssembler, TransmitOutcome};
pub use transport::Transport;
