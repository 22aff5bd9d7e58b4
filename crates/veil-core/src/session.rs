//! Conversation sync session.
//!
//! The peer that has something to deliver dials the other side's room
//! service and pushes. Session layout, server first:
//!
//! 1. server: 32-byte random challenge
//! 2. client: `AuthRequest` signing `challenge || room id`
//! 3. server: `AuthOK`, `AuthFailed` or `MalformedUUID`
//! 4. server: `SyncOffer` (held sync map plus known members)
//! 5. client: message count, then per message: the message, answered by
//!    `MessagesOK` or `MessageSigInvalid`; `File` messages are followed by
//!    their attachment blocks
//! 6. server: `SyncOK`
//!
//! A message is appended on the serving side only after its attachment is
//! complete, and counts as delivered on the pushing side only once the
//! server acknowledged it (and its attachment).

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace};

use veil_net::{FramedConnection, NetError};
use veil_shared::constants::CHALLENGE_SIZE;
use veil_shared::protocol::AuthRequest;
use veil_shared::{ContentType, Identity, Message, RemoteIdentity, RoomId, StatusCode};

use crate::attachment::{receive_attachment, send_attachment};
use crate::error::{Result, RoomError};
use crate::room::{Received, Room};
use crate::sync::SyncOffer;

/// Upper bound on messages announced in one session.
pub const MAX_MESSAGES_PER_SESSION: i64 = 100_000;

/// What a pushing session delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub sent: usize,
    pub attachments: usize,
}

/// What a served session accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServeReport {
    pub accepted: usize,
    pub duplicates: usize,
}

/// Dial `peer` and push everything it lacks.
pub(crate) async fn push_to_peer(room: &Room, peer: &RemoteIdentity) -> Result<SyncReport> {
    let config = room.config();
    let stream = room
        .services()
        .transport
        .dial(&peer.network_address(), config.conversation_port)
        .await?;
    let mut conn = FramedConnection::with_label(stream, peer.fingerprint().short());

    let outcome = match tokio::time::timeout(config.io_timeout, push(room, peer, &mut conn)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(NetError::Timeout(config.io_timeout).into()),
    };
    if let Err(e) = conn.close().await {
        trace!(peer = %peer.fingerprint().short(), error = %e, "Close after sync failed");
    }
    outcome
}

async fn push<S>(
    room: &Room,
    peer: &RemoteIdentity,
    conn: &mut FramedConnection<S>,
) -> Result<SyncReport>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let challenge = conn.read_bytes().await?;
    if challenge.len() != CHALLENGE_SIZE {
        return Err(NetError::BadFrameLength {
            expected: CHALLENGE_SIZE,
            found: challenge.len(),
        }
        .into());
    }

    let room_text = room.id().to_string();
    let auth = AuthRequest {
        room_id: room_text.clone(),
        fingerprint: room.fingerprint().clone(),
        signature: room
            .identity()
            .sign_bytes(&AuthRequest::signed_data(&challenge, &room_text)),
    };
    conn.write_struct(&auth)?;
    conn.flush().await?;

    match conn.read_status().await? {
        StatusCode::AuthOk => {}
        status => return Err(RoomError::AuthRejected(status)),
    }

    let offer: SyncOffer = conn.read_struct().await?;
    room.record_delivery(peer.fingerprint(), &offer.held).await;
    let mut plan = room.plan_for(&offer).await?;

    conn.write_int(plan.len() as i64)?;
    conn.flush().await?;

    let blobs = room.services().blobs.clone();
    let mut report = SyncReport::default();
    for message in plan.messages().to_vec() {
        conn.write_struct(&message)?;
        conn.flush().await?;
        match conn.read_status().await? {
            StatusCode::MessagesOk => {}
            StatusCode::MessageSigInvalid => {
                return Err(RoomError::Untrusted {
                    peer: peer.fingerprint().to_string(),
                    reason: format!("peer refused message {}", message.short_id()),
                })
            }
            found => {
                return Err(NetError::UnexpectedStatus {
                    expected: StatusCode::MessagesOk,
                    found,
                }
                .into())
            }
        }

        if message.content_type == ContentType::File {
            let file = message
                .file_ref()
                .map_err(|e| RoomError::Protocol(e.to_string()))?;
            send_attachment(conn, blobs.as_ref(), &file.blob_id).await?;
            report.attachments += 1;
        }

        plan.confirm(&message);
        room.record_delivery(peer.fingerprint(), plan.confirmed())
            .await;
        report.sent += 1;
    }

    conn.expect_status(StatusCode::SyncOk).await?;
    Ok(report)
}

/// Serve one inbound conversation connection. `lookup` resolves the room
/// named in the client's authentication.
pub(crate) async fn serve<S, F>(conn: &mut FramedConnection<S>, lookup: F) -> Result<ServeReport>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    F: FnOnce(&RoomId) -> Option<Room>,
{
    let challenge: [u8; CHALLENGE_SIZE] = rand::random();
    conn.write_bytes(&challenge)?;
    conn.flush().await?;

    let auth: AuthRequest = conn.read_struct().await?;
    let Ok(room_id) = RoomId::parse(&auth.room_id) else {
        conn.send_status(StatusCode::MalformedUuid).await?;
        return Err(RoomError::Protocol(format!("malformed room id '{}'", auth.room_id)));
    };
    let Some(room) = lookup(&room_id) else {
        conn.send_status(StatusCode::AuthFailed).await?;
        return Err(RoomError::RoomNotFound(room_id));
    };
    let Some(peer) = room.peer_identity(&auth.fingerprint).await else {
        conn.send_status(StatusCode::AuthFailed).await?;
        return Err(RoomError::UnknownSender(auth.fingerprint));
    };
    let signed = AuthRequest::signed_data(&challenge, &auth.room_id);
    if peer.verify(&signed, &auth.signature).is_err() {
        conn.send_status(StatusCode::AuthFailed).await?;
        return Err(RoomError::Untrusted {
            peer: auth.fingerprint.to_string(),
            reason: "bad challenge signature".to_string(),
        });
    }

    conn.write_status(StatusCode::AuthOk)?;
    conn.write_struct(&room.sync_offer().await?)?;
    conn.flush().await?;
    debug!(room = %room_id, peer = %peer.fingerprint().short(), "Peer authenticated");

    let count = conn.read_int().await?;
    if !(0..=MAX_MESSAGES_PER_SESSION).contains(&count) {
        return Err(RoomError::Protocol(format!("invalid message count {count}")));
    }

    let mut report = ServeReport::default();
    for _ in 0..count {
        let message: Message = conn.read_struct().await?;
        match receive_one(&room, &peer, conn, message).await? {
            Received::Appended => report.accepted += 1,
            Received::Duplicate => report.duplicates += 1,
        }
    }

    conn.send_status(StatusCode::SyncOk).await?;
    if report.accepted > 0 {
        info!(
            room = %room_id,
            peer = %peer.fingerprint().short(),
            accepted = report.accepted,
            duplicates = report.duplicates,
            "Sync received"
        );
    }
    Ok(report)
}

async fn receive_one<S>(
    room: &Room,
    peer: &RemoteIdentity,
    conn: &mut FramedConnection<S>,
    message: Message,
) -> Result<Received>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let fresh = match room.verify_incoming(&message).await {
        Ok(fresh) => fresh,
        Err(e) => {
            let _ = conn.send_status(StatusCode::MessageSigInvalid).await;
            return Err(e);
        }
    };

    let file = match message.content_type {
        ContentType::File => match message.file_ref() {
            Ok(file) => Some(file),
            Err(e) => {
                let _ = conn.send_status(StatusCode::MessageSigInvalid).await;
                return Err(RoomError::Protocol(e.to_string()));
            }
        },
        _ => None,
    };

    let Some(file) = file else {
        conn.send_status(StatusCode::MessagesOk).await?;
        return room.commit_incoming(message, Some(peer.fingerprint())).await;
    };

    // Another session is already receiving this blob: drop the connection
    // and let the pusher retry.
    let mut claim = if fresh {
        let claim = room
            .claim_inbound_blob(file.blob_id)
            .ok_or_else(|| RoomError::Protocol(format!("blob {} already in transfer", file.blob_id)))?;
        Some(claim)
    } else {
        None
    };
    conn.send_status(StatusCode::MessagesOk).await?;

    // A blob we already hold (re-shared, or named by a crafted message) is
    // never rewritten; its blocks are read and discarded.
    let blobs = room.services().blobs.clone();
    let store_blob = claim.is_some() && !blobs.contains(&file.blob_id).await;
    if store_blob {
        if let Some(claim) = claim.as_mut() {
            claim.track_partial(blobs.clone());
        }
    }
    let target = store_blob.then_some(&file.blob_id);
    let transfer = receive_attachment(conn, blobs.as_ref(), target, room.config().max_attachment_size).await;
    // A failed transfer has already removed the blob it created.
    if let (Err(_), Some(claim)) = (&transfer, claim.as_mut()) {
        claim.settle();
    }
    transfer?;

    // Releasing an unsettled claim removes the blob of a message that
    // could not be committed.
    let received = room.commit_incoming(message, Some(peer.fingerprint())).await;
    if let (Ok(_), Some(claim)) = (&received, claim.as_mut()) {
        claim.settle();
    }
    received
}
