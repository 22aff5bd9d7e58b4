use serde::Serialize;

use veil_shared::{Fingerprint, Identity, Message, RemoteIdentity, RoomId, Timestamp};

use crate::error::CommandError;
use crate::history::MessageLog;
use crate::sync::SyncMap;

/// Another member of a room as seen locally.
#[derive(Debug, Clone)]
pub struct Peer {
    identity: RemoteIdentity,
    nickname: Option<String>,
    is_admin: bool,
    last_synced: SyncMap,
}

impl Peer {
    pub fn new(identity: RemoteIdentity, is_admin: bool) -> Self {
        Self {
            identity,
            nickname: None,
            is_admin,
            last_synced: SyncMap::new(),
        }
    }

    pub fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.identity.fingerprint()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// What this peer is known to hold.
    pub fn last_synced(&self) -> &SyncMap {
        &self.last_synced
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            fingerprint: self.fingerprint().clone(),
            nickname: self.nickname.clone(),
            is_admin: self.is_admin,
            last_synced: self.last_synced.latest(),
        }
    }
}

/// Snapshot of a [`Peer`] handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub fingerprint: Fingerprint,
    pub nickname: Option<String>,
    pub is_admin: bool,
    pub last_synced: Option<Timestamp>,
}

/// Mutable state of one room, guarded by the room's lock. Command handlers
/// operate on it directly.
#[derive(Debug)]
pub struct RoomState {
    id: RoomId,
    self_fingerprint: Fingerprint,
    name: String,
    self_nickname: Option<String>,
    self_admin: bool,
    peers: Vec<Peer>,
    log: MessageLog,
    sync_state: SyncMap,
    pub(crate) closed: bool,
}

impl RoomState {
    pub fn new(id: RoomId, self_fingerprint: Fingerprint, self_admin: bool) -> Self {
        Self {
            id,
            self_fingerprint,
            name: String::new(),
            self_nickname: None,
            self_admin,
            peers: Vec::new(),
            log: MessageLog::new(),
            sync_state: SyncMap::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn self_fingerprint(&self) -> &Fingerprint {
        &self.self_fingerprint
    }

    pub fn is_self(&self, fingerprint: &Fingerprint) -> bool {
        &self.self_fingerprint == fingerprint
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn self_nickname(&self) -> Option<&str> {
        self.self_nickname.as_deref()
    }

    pub fn self_admin(&self) -> bool {
        self.self_admin
    }

    /// Whether `fingerprint` (ourselves or a peer) holds admin rights.
    pub fn is_admin(&self, fingerprint: &Fingerprint) -> bool {
        if self.is_self(fingerprint) {
            return self.self_admin;
        }
        self.peer(fingerprint).is_some_and(Peer::is_admin)
    }

    /// Every member holding admin rights, ourselves included.
    pub fn admins(&self) -> Vec<Fingerprint> {
        let peers = self
            .peers
            .iter()
            .filter(|p| p.is_admin)
            .map(|p| p.fingerprint().clone());
        self.self_admin
            .then(|| self.self_fingerprint.clone())
            .into_iter()
            .chain(peers)
            .collect()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, fingerprint: &Fingerprint) -> Option<&Peer> {
        self.peers.iter().find(|p| p.fingerprint() == fingerprint)
    }

    fn peer_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.fingerprint() == fingerprint)
    }

    /// Add a peer unless it is already present or is ourselves.
    pub fn add_peer(&mut self, identity: RemoteIdentity, is_admin: bool) -> bool {
        let fingerprint = identity.fingerprint();
        if self.is_self(fingerprint) || self.peer(fingerprint).is_some() {
            return false;
        }
        self.peers.push(Peer::new(identity, is_admin));
        true
    }

    pub fn remove_peer(&mut self, fingerprint: &Fingerprint) -> Option<Peer> {
        let index = self
            .peers
            .iter()
            .position(|p| p.fingerprint() == fingerprint)?;
        Some(self.peers.remove(index))
    }

    /// Set the nickname of ourselves or of a peer.
    pub fn set_nickname(
        &mut self,
        fingerprint: &Fingerprint,
        nickname: impl Into<String>,
    ) -> Result<(), CommandError> {
        if self.is_self(fingerprint) {
            self.self_nickname = Some(nickname.into());
            return Ok(());
        }
        let peer = self
            .peer_mut(fingerprint)
            .ok_or_else(|| CommandError::PeerNotFound(fingerprint.to_string()))?;
        peer.nickname = Some(nickname.into());
        Ok(())
    }

    /// Grant admin rights to ourselves or a peer.
    pub fn promote(&mut self, fingerprint: &Fingerprint) -> Result<(), CommandError> {
        if self.is_self(fingerprint) {
            self.self_admin = true;
            return Ok(());
        }
        let peer = self
            .peer_mut(fingerprint)
            .ok_or_else(|| CommandError::PeerNotFound(fingerprint.to_string()))?;
        peer.is_admin = true;
        Ok(())
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Newest timestamp held per sender.
    pub fn sync_state(&self) -> &SyncMap {
        &self.sync_state
    }

    /// Timestamp for the next locally authored message. Strictly greater
    /// than any of our earlier ones.
    pub(crate) fn next_timestamp(&self) -> Timestamp {
        let last = self
            .sync_state
            .get(&self.self_fingerprint)
            .unwrap_or(Timestamp::ZERO);
        Timestamp::next_after(last)
    }

    /// Append to the log and advance the sync state.
    pub(crate) fn append(&mut self, message: Message) -> bool {
        let (sender, timestamp) = (message.sender.clone(), message.timestamp);
        if !self.log.append(message) {
            return false;
        }
        self.sync_state.advance(&sender, timestamp);
        true
    }

    /// Whether `peer` may lack something we hold.
    pub(crate) fn needs_sync(&self, peer: &Fingerprint) -> bool {
        self.peer(peer)
            .is_some_and(|p| !p.last_synced.covers(&self.sync_state))
    }

    /// Fold what `peer` is known to hold into its record.
    pub(crate) fn record_delivery(&mut self, peer: &Fingerprint, held: &SyncMap) {
        if let Some(p) = self.peer_mut(peer) {
            p.last_synced.merge(held);
        }
    }

    /// `peer` delivered `message` to us, so it holds it.
    pub(crate) fn record_held(&mut self, peer: &Fingerprint, message: &Message) {
        if let Some(p) = self.peer_mut(peer) {
            p.last_synced.advance(&message.sender, message.timestamp);
        }
    }
}
