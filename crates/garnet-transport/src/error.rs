use garnet_binary::BinaryError;
use std::io;
use thiserror::Error;

/// Errors surfaced by the transport engine.
///
/// The wire-rejection kinds (truncated packet, unknown channel tag,
/// undecodable header) are typed so the pump can say what it drops; they are
/// logged there and never reach the caller.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An I/O error from the underlying UDP socket.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// A datagram shorter than the fixed packet header.
    #[error("truncated packet: {len} bytes")]
    TruncatedPacket { len: usize },

    /// A header whose channel tag names no known channel.
    #[error("unknown channel tag {0:#04x}")]
    UnknownChannel(u8),

    /// A header or payload that failed binary decoding.
    #[error("binary decode error: {0}")]
    Binary(#[from] BinaryError),

    /// A send was attempted on an endpoint constructed without a remote.
    #[error("endpoint has no remote address configured")]
    NoRemote,

    /// The endpoint has been shut down.
    #[error("endpoint is closed")]
    Closed,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
