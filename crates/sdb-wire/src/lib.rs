//! Wire-level client plumbing for the Mono soft debugger ("SDB") protocol.
//!
//! The Godot Mono runtime embeds the Mono debugger agent, which speaks a
//! JDWP-derived binary protocol over TCP. This crate owns the pieces that do not
//! depend on session state:
//!
//! - [`transport`]: connecting, accepting, the `DWP-Handshake` banner, and the
//!   split into framed read/write halves.
//! - [`codec`]: 11-byte packet headers, payload readers/writers, and a
//!   [`tokio_util::codec`] implementation that reassembles frames from partial
//!   reads and rejects oversized headers before allocating.
//! - [`protocol`]: command sets, event kinds, typed commands, reply parsers and
//!   composite event decoding.
//! - [`pending`]: correlation id allocation for in-flight commands.
//!
//! `sdb-session` builds the debug session state machine on top of this crate.

use std::{io, net::SocketAddr};

use thiserror::Error;

pub mod codec;
pub mod pending;
pub mod protocol;
pub mod transport;

// The mock agent is only needed for tests and downstream integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use codec::{
    decode_packet_bytes, Packet, PacketCodec, PacketKind, PacketReader, PacketWriter,
    DEFAULT_MAX_PACKET_BYTES, FLAG_REPLY, HANDSHAKE, HEADER_LEN,
};
pub use pending::PendingTable;
pub use protocol::{
    parse_composite_event, AgentEvent, Command, CompositeEvent, DebugInfo, EventModifier,
    FrameId, FrameInfo, LineEntry, LocalVariable, LocalsInfo, Location, MethodId, ObjectId,
    ProtocolVersion, ThreadId, TypeId, Value, VersionInfo,
};
pub use transport::{connect_with_backoff, Backoff, Connection, Listener, PacketSink, PacketStream};

pub type Result<T, E = WireError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to connect to debug agent at {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for debug agent at {addr} after {attempts} attempt(s)")]
    ConnectTimeout { addr: SocketAddr, attempts: u32 },
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("debug agent rejected command with error code {error_code}")]
    CommandFailed { error_code: u16 },
    #[error("connection closed")]
    ConnectionClosed,
}

impl WireError {
    /// Transport and framing failures leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::CommandFailed { .. })
    }
}
