use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Outcome of feeding a single incoming datagram through the decoder, for all cases except
///  regular success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketProcessError {
    #[error("packet could not be decrypted")]
    DecryptFailed,
    #[error("failed to derive the decryption key")]
    DecryptKeyGenFailed,
    #[error("duplicated packet")]
    DuplicatedPacket,
    #[error("fragment buffer underflow: {0}")]
    BufferUnderflow(String),
    #[error("fragment buffer overflow: {0}")]
    BufferOverflow(String),
    #[error("reassembled command exceeds the maximum size ({0} bytes)")]
    CommandTooLarge(usize),
    #[error("fragment sequence is longer than the reassembly buffer")]
    CommandSequenceLengthTooLong,
    #[error("failed to decompress command")]
    CommandDecompressFailed,
    #[error("malformed packet: {0}")]
    InvalidPacket(&'static str),
}

impl PacketProcessError {
    /// Fatal errors must close the connection, all others only drop the offending packet
    pub fn is_fatal(&self) -> bool {
        matches!(self, PacketProcessError::CommandTooLarge(_) | PacketProcessError::CommandSequenceLengthTooLong)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptError {
    #[error("failed to generate key / nonce")]
    KeyGenerationFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("invalid shared secret material: {0}")]
    InvalidSecret(&'static str),
}

/// The reason a connection was closed. Every connection is closed exactly once, and the
///  reason is what the server reports to the client (and the logs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// resend budget exhausted, or the peer went silent
    Timeout,
    ProtocolViolation(String),
    PeerClosed,
    Server(String),
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Server(msg) => write!(f, "closed by server: {}", msg),
        }
    }
}
