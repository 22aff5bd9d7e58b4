/// Wire protocol version, carried in handshake records
pub const PROTOCOL_VERSION: u8 = 1;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Hard upper bound for one encoded (and decoded) frame payload (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Payloads longer than this are candidates for DEFLATE compression
pub const COMPRESSION_THRESHOLD: usize = 128;

/// Attachment block size (512 KiB), always below `MAX_FRAME_SIZE`
pub const BLOCK_SIZE: usize = 512 * 1024;

/// Default cap on a single attachment (50 MiB)
pub const MAX_ATTACHMENT_SIZE: u64 = 50 * 1024 * 1024;

/// Size of the random challenge issued on conversation connections
pub const CHALLENGE_SIZE: usize = 32;

/// Public port of the contact (handshake) endpoint
pub const CONTACT_PORT: u16 = 5444;

/// Public port of the conversation (sync) endpoint
pub const CONVERSATION_PORT: u16 = 5445;

/// Default interval between sync ticks of a peer worker
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;

/// Default ceiling for the failure backoff of a peer worker
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Default per-session I/O timeout
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 60;

/// Key derivation / domain separation contexts (BLAKE3)
pub const KDF_CONTEXT_PAYLOAD_DIGEST: &str = "veil-payload-digest-v1";

/// Tor v3 onion address checksum prefix and version byte
pub const ONION_CHECKSUM_PREFIX: &[u8] = b".onion checksum";
pub const ONION_VERSION: u8 = 0x03;
