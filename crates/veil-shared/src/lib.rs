// Identity, fingerprints and wire records shared by every Veil crate.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{FingerprintError, IdentityError, MessageError};
pub use identity::{ContactIdentity, Identity, RemoteIdentity, SelfIdentity};
pub use protocol::{ContentType, FileRef, Message, StatusCode};
pub use types::{BlobId, Fingerprint, NetworkAddress, RequestId, RoomId, Timestamp};
