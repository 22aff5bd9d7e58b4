use thiserror::Error;

use veil_net::NetError;
use veil_shared::{BlobId, Fingerprint, FingerprintError, IdentityError, RequestId, RoomId, StatusCode};
use veil_store::StoreError;

/// Rejections raised by command handlers. A rejected command is still kept
/// in the log; only its effect on room state is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Handler for '{expected}' received '{found}'")]
    WrongCommand { expected: String, found: String },

    #[error("'{keyword}' needs {needed} argument(s), got {got}")]
    NotEnoughArguments {
        keyword: String,
        needed: usize,
        got: usize,
    },

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("{0} is not an admin of this room")]
    NotAdmin(String),

    #[error("Invalid fingerprint '{0}'")]
    InvalidFingerprint(String),
}

/// Failures of the contact handshake.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    /// The response was not signed by the contact we dialed. Not retried.
    #[error("Contact response is not signed by {0}")]
    Untrusted(String),

    #[error("Invalid identity in handshake: {0}")]
    Identity(#[from] IdentityError),
}

impl HandshakeError {
    pub fn is_untrusted(&self) -> bool {
        matches!(self, HandshakeError::Untrusted(_))
    }
}

/// Failures of a block-wise attachment transfer.
#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Blob store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid block count {0}")]
    InvalidBlockCount(i64),

    #[error("Attachment of {blocks} blocks exceeds the limit of {max}")]
    TooManyBlocks { blocks: u64, max: u64 },

    #[error("Block of {size} bytes exceeds the block size {max}")]
    OversizedBlock { size: usize, max: usize },
}

/// Everything a room, a peer worker or the node can fail with.
#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Blob store error: {0}")]
    Store(#[from] StoreError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Attachment transfer failed: {0}")]
    Attachment(#[from] AttachmentError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Invalid fingerprint: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Invalid identity: {0}")]
    Identity(#[from] IdentityError),

    /// A signature or authentication check failed.
    #[error("Untrusted data from {peer}: {reason}")]
    Untrusted { peer: String, reason: String },

    /// The remote refused our authentication.
    #[error("Peer rejected authentication with {0}")]
    AuthRejected(StatusCode),

    #[error("Sender {0} is not a member of this room")]
    UnknownSender(Fingerprint),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Room already exists: {0}")]
    RoomExists(RoomId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Blob not found: {0}")]
    BlobNotFound(BlobId),

    /// The room was deleted while the operation was in flight.
    #[error("Room is closed")]
    Closed,
}

impl RoomError {
    /// Failures worth retrying on the next tick without raising an alarm.
    pub fn is_transport(&self) -> bool {
        match self {
            RoomError::Net(e) => e.is_transport(),
            RoomError::Handshake(HandshakeError::Net(e)) => e.is_transport(),
            RoomError::Attachment(AttachmentError::Net(e)) => e.is_transport(),
            RoomError::AuthRejected(_) => true,
            _ => false,
        }
    }

    /// Signature or authentication failures.
    pub fn is_untrusted(&self) -> bool {
        match self {
            RoomError::Untrusted { .. } | RoomError::UnknownSender(_) => true,
            RoomError::Handshake(e) => e.is_untrusted(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;
