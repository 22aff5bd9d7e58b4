use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Missing '@' separator")]
    MissingSeparator,

    #[error("Public key is not valid base64url")]
    Base64Decode,

    #[error("Public key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("Public key is not a valid Ed25519 point")]
    InvalidKey,

    #[error("Network address {found} does not match key (expected {expected})")]
    AddressMismatch { expected: String, found: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Unknown content type tag {0}")]
    UnknownContentType(u8),

    #[error("Malformed file reference: {0}")]
    MalformedFileRef(String),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}
