use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{KDF_CONTEXT_PAYLOAD_DIGEST, PROTOCOL_VERSION};
use crate::error::{IdentityError, MessageError};
use crate::identity::{Identity, SelfIdentity};
use crate::types::{BlobId, Fingerprint, Timestamp};

/// What a message payload means.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    Text = 0x01,
    Command = 0x02,
    File = 0x03,
}

impl ContentType {
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x01 => Ok(Self::Text),
            0x02 => Ok(Self::Command),
            0x03 => Ok(Self::File),
            other => Err(MessageError::UnknownContentType(other)),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A signed room message. Immutable once signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: Fingerprint,
    pub timestamp: Timestamp,
    pub content_type: ContentType,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    /// Build and sign a message authored by `identity`.
    pub fn sign(
        identity: &SelfIdentity,
        timestamp: Timestamp,
        content_type: ContentType,
        payload: Vec<u8>,
    ) -> Self {
        let signed = signed_bytes(identity.fingerprint(), timestamp, content_type, &payload);
        Self {
            sender: identity.fingerprint().clone(),
            timestamp,
            content_type,
            payload,
            signature: identity.sign_bytes(&signed),
        }
    }

    /// Bytes covered by the signature:
    /// `sender || timestamp (i64 LE) || blake3(content type || payload)`.
    pub fn signed_data(&self) -> Vec<u8> {
        signed_bytes(&self.sender, self.timestamp, self.content_type, &self.payload)
    }

    /// Check the signature against the identity the caller trusts for `sender`.
    pub fn verify_with<I: Identity + ?Sized>(&self, signer: &I) -> Result<(), IdentityError> {
        if signer.fingerprint() != &self.sender {
            return Err(IdentityError::InvalidSignature);
        }
        signer.verify(&self.signed_data(), &self.signature)
    }

    pub fn text(&self) -> Result<&str, MessageError> {
        std::str::from_utf8(&self.payload).map_err(|_| MessageError::InvalidUtf8)
    }

    pub fn file_ref(&self) -> Result<FileRef, MessageError> {
        FileRef::parse(self.text()?)
    }

    /// Short hex prefix of the signature, for logs.
    pub fn short_id(&self) -> String {
        hex::encode(&self.signature[..self.signature.len().min(6)])
    }
}

fn signed_bytes(
    sender: &Fingerprint,
    timestamp: Timestamp,
    content_type: ContentType,
    payload: &[u8],
) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PAYLOAD_DIGEST);
    hasher.update(&[content_type.tag()]);
    hasher.update(payload);
    let digest = hasher.finalize();

    let mut data = Vec::with_capacity(sender.as_str().len() + 8 + 32);
    data.extend_from_slice(sender.as_str().as_bytes());
    data.extend_from_slice(&timestamp.to_le_bytes());
    data.extend_from_slice(digest.as_bytes());
    data
}

/// Payload of a `File` message: `"<blob id>[ <file name>]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub blob_id: BlobId,
    pub file_name: Option<String>,
}

impl FileRef {
    pub fn new(blob_id: BlobId, file_name: Option<String>) -> Self {
        Self { blob_id, file_name }
    }

    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let (id_part, name_part) = match text.split_once(' ') {
            Some((id, name)) => (id, Some(name.to_string())),
            None => (text, None),
        };
        let blob_id =
            BlobId::parse(id_part).map_err(|_| MessageError::MalformedFileRef(text.to_string()))?;
        Ok(Self {
            blob_id,
            file_name: name_part.filter(|n| !n.is_empty()),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        match &self.file_name {
            Some(name) => format!("{} {}", self.blob_id, name).into_bytes(),
            None => self.blob_id.to_string().into_bytes(),
        }
    }
}

/// One-byte status codes exchanged during a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    AuthOk = 0x01,
    AuthFailed = 0x02,
    MessagesOk = 0x03,
    MessageSigInvalid = 0x04,
    BlockOk = 0x05,
    BlobOk = 0x06,
    SyncOk = 0x07,
    MalformedUuid = 0x08,
}

impl StatusCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::AuthOk),
            0x02 => Some(Self::AuthFailed),
            0x03 => Some(Self::MessagesOk),
            0x04 => Some(Self::MessageSigInvalid),
            0x05 => Some(Self::BlockOk),
            0x06 => Some(Self::BlobOk),
            0x07 => Some(Self::SyncOk),
            0x08 => Some(Self::MalformedUuid),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AuthOk => "AuthOK",
            Self::AuthFailed => "AuthFailed",
            Self::MessagesOk => "MessagesOK",
            Self::MessageSigInvalid => "MessageSigInvalid",
            Self::BlockOk => "BlockOK",
            Self::BlobOk => "BlobOK",
            Self::SyncOk => "SyncOK",
            Self::MalformedUuid => "MalformedUUID",
        };
        f.write_str(name)
    }
}

/// First record on a contact connection (inviter -> responder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequest {
    pub version: u8,
    pub target: Fingerprint,
    pub inviter: Fingerprint,
    /// Proposed room id as text; the responder validates it.
    pub room_id: String,
    /// Room members holding admin rights, as the inviter sees them.
    pub admins: Vec<Fingerprint>,
}

impl ContactRequest {
    pub fn new(
        target: Fingerprint,
        inviter: Fingerprint,
        room_id: String,
        admins: Vec<Fingerprint>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            target,
            inviter,
            room_id,
            admins,
        }
    }
}

/// Responder's answer: a fresh room identity vouched for by the contact key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactResponse {
    pub conversation: Fingerprint,
    pub signature: Vec<u8>,
}

/// Client's answer to the server challenge on a conversation connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub room_id: String,
    pub fingerprint: Fingerprint,
    /// Signature over `challenge || room_id`.
    pub signature: Vec<u8>,
}

impl AuthRequest {
    pub fn signed_data(challenge: &[u8], room_id: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(challenge.len() + room_id.len());
        data.extend_from_slice(challenge);
        data.extend_from_slice(room_id.as_bytes());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sign_verify() {
        let id = SelfIdentity::generate();
        let msg = Message::sign(&id, Timestamp(42), ContentType::Text, b"hi".to_vec());
        assert!(msg.verify_with(&id.to_remote()).is_ok());
    }

    #[test]
    fn test_relabelled_content_type_fails() {
        let id = SelfIdentity::generate();
        let mut msg = Message::sign(&id, Timestamp(42), ContentType::Text, b"nick Eve".to_vec());
        msg.content_type = ContentType::Command;
        assert!(msg.verify_with(&id.to_remote()).is_err());
    }

    #[test]
    fn test_wrong_signer_fails() {
        let id = SelfIdentity::generate();
        let other = SelfIdentity::generate();
        let msg = Message::sign(&id, Timestamp(1), ContentType::Text, b"x".to_vec());
        assert!(msg.verify_with(&other.to_remote()).is_err());
    }

    #[test]
    fn test_message_bincode_roundtrip() {
        let id = SelfIdentity::generate();
        let msg = Message::sign(&id, Timestamp::now(), ContentType::Command, b"nick Bob".to_vec());
        let bytes = bincode::serialize(&msg).unwrap();
        let restored: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, restored);
        assert!(restored.verify_with(&id.to_remote()).is_ok());
    }

    #[test]
    fn test_file_ref_parse() {
        let id = BlobId::new();
        let with_name = FileRef::new(id, Some("holiday photo.jpg".to_string()));
        let parsed = FileRef::parse(std::str::from_utf8(&with_name.to_payload()).unwrap()).unwrap();
        assert_eq!(parsed, with_name);

        let bare = FileRef::parse(&id.to_string()).unwrap();
        assert_eq!(bare.file_name, None);

        assert!(FileRef::parse("nope").is_err());
    }

    #[test]
    fn test_status_code_bytes() {
        for b in 0x01..=0x08u8 {
            assert_eq!(StatusCode::from_byte(b).unwrap() as u8, b);
        }
        assert!(StatusCode::from_byte(0).is_none());
        assert_eq!(StatusCode::MalformedUuid.to_string(), "MalformedUUID");
    }
}
