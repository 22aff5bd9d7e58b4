use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use uuid::Uuid;

use crate::constants::{ONION_CHECKSUM_PREFIX, ONION_VERSION, PUBKEY_SIZE};
use crate::error::FingerprintError;

/// Identifier of a room, agreed during the handshake and identical on both sides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s.trim()).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a pending room request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque attachment identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlobId(pub Uuid);

impl BlobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_micros())
    }

    /// Next timestamp for a sender whose previous message carried `last`.
    /// Never returns a value `<= last`.
    pub fn next_after(last: Timestamp) -> Self {
        let now = Self::now();
        if now > last {
            now
        } else {
            Timestamp(last.0.saturating_add(1))
        }
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn to_datetime(self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_micros(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// Tor v3 onion address derived from an Ed25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddress(String);

impl NetworkAddress {
    /// `base32(pubkey || checksum[..2] || version) + ".onion"`, lowercase.
    pub fn from_public_key(pubkey: &[u8; PUBKEY_SIZE]) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(ONION_CHECKSUM_PREFIX);
        hasher.update(pubkey);
        hasher.update([ONION_VERSION]);
        let checksum = hasher.finalize();

        let mut combined = [0u8; PUBKEY_SIZE + 3];
        combined[..PUBKEY_SIZE].copy_from_slice(pubkey);
        combined[PUBKEY_SIZE..PUBKEY_SIZE + 2].copy_from_slice(&checksum[..2]);
        combined[PUBKEY_SIZE + 2] = ONION_VERSION;

        Self(format!("{}.onion", base32_encode(&combined).to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part without the `.onion` suffix.
    pub fn host(&self) -> &str {
        self.0.strip_suffix(".onion").unwrap_or(&self.0)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// RFC 4648 alphabet, no padding
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut result = String::with_capacity((data.len() * 8).div_ceil(5));

    let mut buffer: u64 = 0;
    let mut bits_left = 0;

    for &byte in data {
        buffer = (buffer << 8) | (byte as u64);
        bits_left += 8;

        while bits_left >= 5 {
            bits_left -= 5;
            let idx = ((buffer >> bits_left) & 0x1f) as usize;
            result.push(ALPHABET[idx] as char);
        }
    }

    if bits_left > 0 {
        let idx = ((buffer << (5 - bits_left)) & 0x1f) as usize;
        result.push(ALPHABET[idx] as char);
    }

    result
}

/// `base64url(public key) + "@" + network address`.
///
/// Self-verifying: the address is recomputed from the key on parse, so a
/// fingerprint that survives [`Fingerprint::parse`] is internally consistent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint {
    text: String,
    public_key: [u8; PUBKEY_SIZE],
}

impl Fingerprint {
    pub fn from_public_key(pubkey: &[u8; PUBKEY_SIZE]) -> Self {
        let address = NetworkAddress::from_public_key(pubkey);
        Self {
            text: format!("{}@{}", URL_SAFE_NO_PAD.encode(pubkey), address),
            public_key: *pubkey,
        }
    }

    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let s = s.trim();
        let (key_part, address_part) =
            s.split_once('@').ok_or(FingerprintError::MissingSeparator)?;

        let key_bytes = URL_SAFE_NO_PAD
            .decode(key_part)
            .map_err(|_| FingerprintError::Base64Decode)?;
        let public_key: [u8; PUBKEY_SIZE] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| FingerprintError::KeyLength(key_bytes.len()))?;

        ed25519_dalek::VerifyingKey::from_bytes(&public_key)
            .map_err(|_| FingerprintError::InvalidKey)?;

        let expected = NetworkAddress::from_public_key(&public_key);
        if expected.as_str() != address_part {
            return Err(FingerprintError::AddressMismatch {
                expected: expected.to_string(),
                found: address_part.to_string(),
            });
        }

        Ok(Self {
            text: s.to_string(),
            public_key,
        })
    }

    pub fn public_key(&self) -> &[u8; PUBKEY_SIZE] {
        &self.public_key
    }

    pub fn network_address(&self) -> NetworkAddress {
        NetworkAddress::from_public_key(&self.public_key)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// First eight characters of the key part, for logs.
    pub fn short(&self) -> &str {
        &self.text[..8]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.text
    }
}
