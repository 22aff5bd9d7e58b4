use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::constants::{PUBKEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE};
use crate::error::IdentityError;
use crate::types::{Fingerprint, NetworkAddress};

/// Capability shared by every identity variant: it has a fingerprint and can
/// check signatures. Only [`SelfIdentity`] and [`ContactIdentity`] can sign.
pub trait Identity {
    fn fingerprint(&self) -> &Fingerprint;

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        verify_signature(self.fingerprint().public_key(), message, signature)
    }

    fn network_address(&self) -> NetworkAddress {
        self.fingerprint().network_address()
    }
}

/// A local Ed25519 identity holding the signing key. One is generated per
/// room; its network address is where the room's peers dial in.
#[derive(Clone)]
pub struct SelfIdentity {
    signing_key: SigningKey,
    fingerprint: Fingerprint,
}

/// Serializable format for storing/exporting an identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; SECRET_KEY_SIZE],
    pub public_key: [u8; PUBKEY_SIZE],
}

impl SelfIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    /// Restore identity from a serialized export, rejecting mismatched halves
    pub fn from_export(export: &IdentityExport) -> Result<Self, IdentityError> {
        let identity = Self::from_secret_bytes(&export.secret_key);
        if identity.public_key_bytes() != export.public_key {
            return Err(IdentityError::KeyFile(
                "public key does not match secret key".to_string(),
            ));
        }
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let fingerprint = Fingerprint::from_public_key(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            fingerprint,
        }
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes (handed to the service registrar)
    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.signing_key.as_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign a message and return the raw signature bytes
    pub fn sign_bytes(&self, message: &[u8]) -> Vec<u8> {
        self.sign(message).to_bytes().to_vec()
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public view of this identity, as peers see it
    pub fn to_remote(&self) -> RemoteIdentity {
        RemoteIdentity {
            verifying_key: self.verifying_key(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.public_key_bytes(),
        }
    }
}

impl Identity for SelfIdentity {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl fmt::Debug for SelfIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfIdentity")
            .field("fingerprint", &self.fingerprint.as_str())
            .finish_non_exhaustive()
    }
}

/// A long-lived identity published on the contact endpoint. Others invite us
/// into rooms by dialing it; it only ever signs handshake responses.
#[derive(Clone, Debug)]
pub struct ContactIdentity {
    inner: SelfIdentity,
}

impl ContactIdentity {
    pub fn generate() -> Self {
        Self {
            inner: SelfIdentity::generate(),
        }
    }

    pub fn from_self(inner: SelfIdentity) -> Self {
        Self { inner }
    }

    /// Signs `conversation_fingerprint || room_id`, binding a freshly minted
    /// room identity to this contact key.
    pub fn sign_conversation(&self, conversation: &Fingerprint, room_id: &[u8]) -> Vec<u8> {
        self.inner
            .sign_bytes(&conversation_binding(conversation, room_id))
    }

    pub fn as_self(&self) -> &SelfIdentity {
        &self.inner
    }
}

impl Identity for ContactIdentity {
    fn fingerprint(&self) -> &Fingerprint {
        self.inner.fingerprint()
    }
}

/// Bytes covered by a contact key's signature during the handshake.
pub fn conversation_binding(conversation: &Fingerprint, room_id: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(conversation.as_str().len() + room_id.len());
    data.extend_from_slice(conversation.as_str().as_bytes());
    data.extend_from_slice(room_id);
    data
}

/// Someone else's identity: public key and derived address only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    verifying_key: VerifyingKey,
    fingerprint: Fingerprint,
}

impl RemoteIdentity {
    /// The key is fully determined by the fingerprint, nothing else is stored.
    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Result<Self, IdentityError> {
        let verifying_key = VerifyingKey::from_bytes(fingerprint.public_key())
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self {
            verifying_key,
            fingerprint: fingerprint.clone(),
        })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl Identity for RemoteIdentity {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let signature = signature_from_slice(signature)?;
        self.verifying_key
            .verify(message, &signature)
            .map_err(|_| IdentityError::InvalidSignature)
    }
}

pub fn signature_from_slice(bytes: &[u8]) -> Result<Signature, IdentityError> {
    if bytes.len() != SIGNATURE_SIZE {
        return Err(IdentityError::InvalidSignature);
    }
    Signature::from_slice(bytes).map_err(|_| IdentityError::InvalidSignature)
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; PUBKEY_SIZE],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature = signature_from_slice(signature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
