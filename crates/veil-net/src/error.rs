use thiserror::Error;

use veil_shared::StatusCode;

/// Errors produced by the framed connection and the transports.
#[derive(Error, Debug)]
pub enum NetError {
    /// Dial, read or write failure on the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed locally while an operation was pending.
    #[error("Connection closed")]
    Closed,

    /// An operation did not finish within the configured deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown compression flag {0}")]
    BadCompressionFlag(u8),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Expected a {expected}-byte frame, got {found}")]
    BadFrameLength { expected: usize, found: usize },

    #[error("Unknown status byte {0:#04x}")]
    UnknownStatus(u8),

    #[error("Unexpected status {found}, expected {expected}")]
    UnexpectedStatus {
        expected: StatusCode,
        found: StatusCode,
    },

    #[error("Frame is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// No service is registered under the dialed address.
    #[error("Unknown service {0}")]
    UnknownService(String),
}

impl NetError {
    /// Dial/read/write failures worth retrying on the next tick.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NetError::Io(_) | NetError::Closed | NetError::Timeout(_) | NetError::UnknownService(_)
        )
    }

    /// The peer broke the wire protocol; the connection must be dropped.
    pub fn is_protocol_violation(&self) -> bool {
        !self.is_transport()
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
