use serde::Serialize;
use tokio::sync::broadcast;

use veil_shared::{Fingerprint, Message, RequestId, RoomId};

/// Something a UI or daemon may want to react to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RoomEvent {
    NewMessage {
        room_id: RoomId,
        message: Message,
    },
    NewRoom {
        room_id: RoomId,
        name: String,
    },
    NewRequest {
        request_id: RequestId,
        room_id: RoomId,
        inviter: Fingerprint,
    },
    PeerAdded {
        room_id: RoomId,
        peer: Fingerprint,
    },
    PeerRemoved {
        room_id: RoomId,
        peer: Fingerprint,
    },
    CommandRejected {
        room_id: RoomId,
        sender: Fingerprint,
        error: String,
    },
    RoomDeleted {
        room_id: RoomId,
    },
    Error {
        room_id: Option<RoomId>,
        error: String,
    },
}

impl RoomEvent {
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            RoomEvent::NewMessage { room_id, .. }
            | RoomEvent::NewRoom { room_id, .. }
            | RoomEvent::NewRequest { room_id, .. }
            | RoomEvent::PeerAdded { room_id, .. }
            | RoomEvent::PeerRemoved { room_id, .. }
            | RoomEvent::CommandRejected { room_id, .. }
            | RoomEvent::RoomDeleted { room_id } => Some(*room_id),
            RoomEvent::Error { room_id, .. } => *room_id,
        }
    }
}

/// Receives engine events. Called from engine tasks; must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: RoomEvent);
}

/// Fans events out to every subscriber of a broadcast channel. Slow
/// subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<RoomEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: RoomEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: RoomEvent) {}
}
