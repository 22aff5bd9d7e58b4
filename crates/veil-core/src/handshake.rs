//! Contact handshake: how a contact is brought into a room.
//!
//! The inviter dials the contact endpoint of a long-lived contact identity
//! and proposes a room id. The responder mints a fresh room identity and
//! returns its fingerprint signed by the contact key, which proves the new
//! identity belongs to the contact the inviter meant to reach. The request
//! also names the room's current admins, the newcomer's starting point for
//! authorizing `promote` and `remove_peer`.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use veil_net::FramedConnection;
use veil_shared::constants::PROTOCOL_VERSION;
use veil_shared::identity::conversation_binding;
use veil_shared::protocol::{ContactRequest, ContactResponse};
use veil_shared::{ContactIdentity, Fingerprint, Identity, RemoteIdentity, RoomId, SelfIdentity};

use crate::error::HandshakeError;

/// Progress of one handshake, for logs and callers that track attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitingResponse,
    Completed,
    Failed,
}

/// Inviter side. Sends the request over `conn` and returns the contact's
/// new room identity once its binding signature checks out.
pub async fn initiate<S>(
    conn: &mut FramedConnection<S>,
    inviter: &SelfIdentity,
    contact: &Fingerprint,
    room_id: &RoomId,
    admins: &[Fingerprint],
) -> Result<RemoteIdentity, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let contact_identity = RemoteIdentity::from_fingerprint(contact)?;
    let room_text = room_id.to_string();

    let request = ContactRequest::new(
        contact.clone(),
        inviter.fingerprint().clone(),
        room_text.clone(),
        admins.to_vec(),
    );
    conn.write_struct(&request)?;
    conn.flush().await?;
    debug!(contact = %contact.short(), state = ?HandshakeState::AwaitingResponse, "Contact request sent");

    let response: ContactResponse = conn.read_struct().await?;
    let binding = conversation_binding(&response.conversation, room_text.as_bytes());
    if contact_identity.verify(&binding, &response.signature).is_err() {
        debug!(contact = %contact.short(), state = ?HandshakeState::Failed, "Bad contact signature");
        return Err(HandshakeError::Untrusted(contact.to_string()));
    }

    let peer = RemoteIdentity::from_fingerprint(&response.conversation)?;
    info!(
        contact = %contact.short(),
        room = %room_id,
        peer = %peer.fingerprint().short(),
        state = ?HandshakeState::Completed,
        "Contact handshake completed"
    );
    Ok(peer)
}

/// A request the responder answered; it becomes a pending room request.
#[derive(Debug, Clone)]
pub struct AcceptedContact {
    pub contact: Fingerprint,
    pub inviter: RemoteIdentity,
    pub room_id: RoomId,
    pub identity: SelfIdentity,
    /// Admins named by the inviter.
    pub admins: Vec<RemoteIdentity>,
}

/// Responder side. Returns `Ok(None)` when the request is dropped without an
/// answer: an unknown target, a foreign protocol version or a malformed
/// room id.
pub async fn respond<S, F>(
    conn: &mut FramedConnection<S>,
    lookup: F,
) -> Result<Option<AcceptedContact>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    F: FnOnce(&Fingerprint) -> Option<ContactIdentity>,
{
    let request: ContactRequest = conn.read_struct().await?;

    if request.version != PROTOCOL_VERSION {
        debug!(version = request.version, "Dropping contact request with foreign version");
        return Ok(None);
    }
    let Some(contact) = lookup(&request.target) else {
        debug!(target = %request.target.short(), "Dropping contact request for unknown identity");
        return Ok(None);
    };
    let Ok(room_id) = RoomId::parse(&request.room_id) else {
        debug!(room = %request.room_id, "Dropping contact request with malformed room id");
        return Ok(None);
    };
    let inviter = RemoteIdentity::from_fingerprint(&request.inviter)?;
    let admins = request
        .admins
        .iter()
        .map(RemoteIdentity::from_fingerprint)
        .collect::<Result<Vec<_>, _>>()?;

    let identity = SelfIdentity::generate();
    let room_text = room_id.to_string();
    let response = ContactResponse {
        conversation: identity.fingerprint().clone(),
        signature: contact.sign_conversation(identity.fingerprint(), room_text.as_bytes()),
    };
    conn.write_struct(&response)?;
    conn.flush().await?;

    info!(
        contact = %contact.fingerprint().short(),
        inviter = %inviter.fingerprint().short(),
        room = %room_id,
        "Answered contact request"
    );
    Ok(Some(AcceptedContact {
        contact: contact.fingerprint().clone(),
        inviter,
        room_id,
        identity,
        admins,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        FramedConnection<tokio::io::DuplexStream>,
        FramedConnection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (FramedConnection::new(a), FramedConnection::new(b))
    }

    #[tokio::test]
    async fn test_handshake_binds_new_identity_to_contact() {
        let contact = ContactIdentity::generate();
        let inviter = SelfIdentity::generate();
        let room_id = RoomId::new();
        let (mut a, mut b) = pair();

        let admins = vec![SelfIdentity::generate().fingerprint().clone()];
        let known = contact.clone();
        let (peer, accepted) = tokio::join!(
            initiate(&mut a, &inviter, contact.fingerprint(), &room_id, &admins),
            respond(&mut b, |fp| (fp == known.fingerprint()).then(|| known.clone()))
        );

        let peer = peer.unwrap();
        let accepted = accepted.unwrap().unwrap();
        assert_eq!(peer.fingerprint(), accepted.identity.fingerprint());
        assert_ne!(peer.fingerprint(), contact.fingerprint());
        assert_eq!(accepted.room_id, room_id);
        assert_eq!(accepted.inviter.fingerprint(), inviter.fingerprint());
        assert_eq!(&accepted.contact, contact.fingerprint());
        let named: Vec<_> = accepted.admins.iter().map(|a| a.fingerprint().clone()).collect();
        assert_eq!(named, admins);
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped_silently() {
        let contact = ContactIdentity::generate();
        let inviter = SelfIdentity::generate();
        let (mut a, mut b) = pair();

        let responder = tokio::spawn(async move {
            let outcome = respond(&mut b, |_| None).await;
            drop(b);
            outcome
        });
        let result = initiate(&mut a, &inviter, contact.fingerprint(), &RoomId::new(), &[]).await;

        assert!(responder.await.unwrap().unwrap().is_none());
        assert!(matches!(result, Err(HandshakeError::Net(_))));
    }

    #[tokio::test]
    async fn test_impostor_response_is_untrusted() {
        let contact = ContactIdentity::generate();
        let impostor = ContactIdentity::generate();
        let inviter = SelfIdentity::generate();
        let room_id = RoomId::new();
        let (mut a, mut b) = pair();

        let (peer, _) = tokio::join!(
            initiate(&mut a, &inviter, contact.fingerprint(), &room_id, &[]),
            respond(&mut b, |_| Some(impostor.clone()))
        );
        let err = peer.unwrap_err();
        assert!(err.is_untrusted());
    }
}
