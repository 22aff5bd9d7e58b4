//! Rooms: a signed, append-only log shared with a set of peers.
//!
//! A [`Room`] is a cheap handle over shared state. All log and membership
//! mutation goes through one async lock; peer workers and connection
//! handlers only hold a reference while they touch the room, and every
//! write is refused once the room is closed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use veil_shared::{
    BlobId, ContentType, FileRef, Fingerprint, Identity, Message, NetworkAddress, RemoteIdentity,
    RoomId, SelfIdentity,
};
use veil_store::BlobStore;

use crate::commands::{Command, Effect};
use crate::config::NodeConfig;
use crate::error::{Result, RoomError};
use crate::events::RoomEvent;
use crate::services::Services;
use crate::state::{PeerInfo, RoomState};
use crate::sync::{SyncMap, SyncOffer, SyncPlan};
use crate::worker::{self, WorkerHandle};

/// Outcome of handing a message to [`Room::receive_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Appended,
    Duplicate,
}

/// Handle to a room. Clones share the same room.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

pub(crate) struct RoomInner {
    id: RoomId,
    identity: SelfIdentity,
    state: Mutex<RoomState>,
    services: Services,
    config: Arc<NodeConfig>,
    workers: StdMutex<HashMap<Fingerprint, WorkerHandle>>,
    inbound_blobs: StdMutex<HashSet<BlobId>>,
    cancel: CancellationToken,
}

impl Room {
    pub(crate) fn new(
        identity: SelfIdentity,
        state: RoomState,
        services: Services,
        config: Arc<NodeConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                id: state.id(),
                identity,
                state: Mutex::new(state),
                services,
                config,
                workers: StdMutex::new(HashMap::new()),
                inbound_blobs: StdMutex::new(HashSet::new()),
                cancel,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RoomInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<RoomInner> {
        Arc::downgrade(&self.inner)
    }

    /// Spawn a worker for every peer currently in the room.
    pub(crate) async fn start(&self) {
        let peers: Vec<RemoteIdentity> = {
            let state = self.inner.state.lock().await;
            state.peers().iter().map(|p| p.identity().clone()).collect()
        };
        for peer in peers {
            self.spawn_worker(peer);
        }
    }

    pub fn id(&self) -> RoomId {
        self.inner.id
    }

    /// Our identity in this room.
    pub fn fingerprint(&self) -> &Fingerprint {
        self.inner.identity.fingerprint()
    }

    pub fn network_address(&self) -> NetworkAddress {
        self.inner.identity.network_address()
    }

    pub async fn name(&self) -> String {
        self.inner.state.lock().await.name().to_string()
    }

    pub async fn self_nickname(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .self_nickname()
            .map(str::to_string)
    }

    /// Whether we hold admin rights in this room.
    pub async fn is_admin(&self) -> bool {
        self.inner.state.lock().await.self_admin()
    }

    /// Members holding admin rights, ourselves included.
    pub async fn admins(&self) -> Vec<Fingerprint> {
        self.inner.state.lock().await.admins()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let state = self.inner.state.lock().await;
        state.peers().iter().map(|p| p.info()).collect()
    }

    /// Snapshot of the log in append order.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().await.log().as_slice().to_vec()
    }

    pub async fn sync_state(&self) -> SyncMap {
        self.inner.state.lock().await.sync_state().clone()
    }

    pub fn active_workers(&self) -> usize {
        self.workers().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn send_text(&self, text: &str) -> Result<Message> {
        self.post(ContentType::Text, text.as_bytes().to_vec()).await
    }

    /// Sign, log and broadcast a command. The command is applied locally
    /// first; if its handler rejects it the message stays in the log and a
    /// [`RoomEvent::CommandRejected`] is emitted.
    pub async fn send_command(&self, command: &Command) -> Result<Message> {
        self.post(ContentType::Command, command.to_payload()).await
    }

    /// Share blob `blob_id`, which must already be in the blob store.
    pub async fn send_file(&self, blob_id: BlobId, file_name: Option<&str>) -> Result<Message> {
        if !self.inner.services.blobs.contains(&blob_id).await {
            return Err(RoomError::BlobNotFound(blob_id));
        }
        let file = FileRef::new(blob_id, file_name.map(str::to_string));
        self.post(ContentType::File, file.to_payload()).await
    }

    /// Store `data` as a new blob and share it.
    pub async fn attach(&self, data: &[u8], file_name: Option<&str>) -> Result<Message> {
        let blob_id = self.inner.services.blobs.import(data).await?;
        self.send_file(blob_id, file_name).await
    }

    /// Wake every peer worker so it syncs now instead of at its next tick.
    pub fn wake_all(&self) {
        self.wake_except(None);
    }

    /// Verify and append a message that arrived from outside. `from` names
    /// the peer that delivered it, if any. Attachments are not fetched.
    pub async fn receive_message(
        &self,
        message: Message,
        from: Option<&Fingerprint>,
    ) -> Result<Received> {
        if !self.verify_incoming(&message).await? {
            return Ok(Received::Duplicate);
        }
        self.commit_incoming(message, from).await
    }

    async fn post(&self, content_type: ContentType, payload: Vec<u8>) -> Result<Message> {
        let (message, effects) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(RoomError::Closed);
            }
            let timestamp = state.next_timestamp();
            let message = Message::sign(&self.inner.identity, timestamp, content_type, payload);
            let effects = self.apply(&mut state, &message).unwrap_or_default();
            (message, effects)
        };
        debug!(
            room = %self.id(),
            id = %message.short_id(),
            content_type = ?content_type,
            "Posted message"
        );
        self.after_append(&message, effects, None);
        Ok(message)
    }

    /// Check that `message` is signed by ourselves or a current peer.
    /// Returns `false` for a message already in the log.
    pub(crate) async fn verify_incoming(&self, message: &Message) -> Result<bool> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed);
        }
        if state.log().contains(message) {
            return Ok(false);
        }
        self.check_signer(&state, message)?;
        Ok(true)
    }

    /// Append a verified message. Membership is re-checked under the lock
    /// because commands may have changed it since verification.
    pub(crate) async fn commit_incoming(
        &self,
        message: Message,
        from: Option<&Fingerprint>,
    ) -> Result<Received> {
        let effects = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(RoomError::Closed);
            }
            if state.log().contains(&message) {
                if let Some(peer) = from {
                    state.record_held(peer, &message);
                }
                return Ok(Received::Duplicate);
            }
            self.check_signer(&state, &message)?;
            if let Some(peer) = from {
                state.record_held(peer, &message);
            }
            self.apply(&mut state, &message).unwrap_or_default()
        };
        debug!(
            room = %self.id(),
            id = %message.short_id(),
            sender = %message.sender.short(),
            "Accepted message"
        );
        self.after_append(&message, effects, from);
        Ok(Received::Appended)
    }

    fn check_signer(&self, state: &RoomState, message: &Message) -> Result<()> {
        let verified = if state.is_self(&message.sender) {
            message.verify_with(&self.inner.identity)
        } else {
            let peer = state
                .peer(&message.sender)
                .ok_or_else(|| RoomError::UnknownSender(message.sender.clone()))?;
            message.verify_with(peer.identity())
        };
        verified.map_err(|_| RoomError::Untrusted {
            peer: message.sender.to_string(),
            reason: format!("bad signature on message {}", message.short_id()),
        })
    }

    /// Append and run the command, if any. `None` for duplicates.
    fn apply(&self, state: &mut RoomState, message: &Message) -> Option<Vec<Effect>> {
        if !state.append(message.clone()) {
            return None;
        }
        if message.content_type != ContentType::Command {
            return Some(Vec::new());
        }
        match self.inner.services.commands.dispatch(message, state) {
            Ok(effects) => Some(effects),
            Err(error) => {
                warn!(
                    room = %self.id(),
                    sender = %message.sender.short(),
                    error = %error,
                    "Command rejected"
                );
                self.notify(RoomEvent::CommandRejected {
                    room_id: self.id(),
                    sender: message.sender.clone(),
                    error: error.to_string(),
                });
                Some(Vec::new())
            }
        }
    }

    fn after_append(&self, message: &Message, effects: Vec<Effect>, from: Option<&Fingerprint>) {
        self.apply_effects(effects);
        self.notify(RoomEvent::NewMessage {
            room_id: self.id(),
            message: message.clone(),
        });
        self.wake_except(from);
    }

    fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::PeerAdded(identity) => {
                    info!(room = %self.id(), peer = %identity.fingerprint().short(), "Peer added");
                    self.notify(RoomEvent::PeerAdded {
                        room_id: self.id(),
                        peer: identity.fingerprint().clone(),
                    });
                    self.spawn_worker(identity);
                }
                Effect::PeerRemoved(fingerprint) => {
                    info!(room = %self.id(), peer = %fingerprint.short(), "Peer removed");
                    self.stop_worker(&fingerprint);
                    self.notify(RoomEvent::PeerRemoved {
                        room_id: self.id(),
                        peer: fingerprint,
                    });
                }
            }
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<Fingerprint, WorkerHandle>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self, peer: RemoteIdentity) {
        if self.is_closed() {
            return;
        }
        let mut workers = self.workers();
        if workers.contains_key(peer.fingerprint()) {
            return;
        }
        let fingerprint = peer.fingerprint().clone();
        let handle = worker::spawn(self.downgrade(), peer, self.inner.cancel.child_token());
        workers.insert(fingerprint, handle);
    }

    fn stop_worker(&self, peer: &Fingerprint) {
        if let Some(handle) = self.workers().remove(peer) {
            handle.stop();
        }
    }

    fn wake_except(&self, skip: Option<&Fingerprint>) {
        for (fingerprint, handle) in self.workers().iter() {
            if Some(fingerprint) != skip {
                handle.wake();
            }
        }
    }

    /// Close the room: refuse further writes, cancel every worker and wait
    /// for all of them to exit.
    pub(crate) async fn shutdown(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.cancel.cancel();
        let handles: Vec<WorkerHandle> = self.workers().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        join_all(handles.into_iter().map(WorkerHandle::join)).await;
        info!(room = %self.id(), workers = count, "Room shut down");
    }

    pub(crate) fn identity(&self) -> &SelfIdentity {
        &self.inner.identity
    }

    pub(crate) fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub(crate) fn services(&self) -> &Services {
        &self.inner.services
    }

    pub(crate) fn notify(&self, event: RoomEvent) {
        self.inner.services.notifier.notify(event);
    }

    pub(crate) async fn peer_identity(&self, fingerprint: &Fingerprint) -> Option<RemoteIdentity> {
        let state = self.inner.state.lock().await;
        state.peer(fingerprint).map(|p| p.identity().clone())
    }

    pub(crate) async fn needs_sync(&self, peer: &Fingerprint) -> bool {
        let state = self.inner.state.lock().await;
        !state.closed && state.needs_sync(peer)
    }

    /// What we advertise to a peer that connects to push messages.
    pub(crate) async fn sync_offer(&self) -> Result<SyncOffer> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed);
        }
        let mut members = vec![state.self_fingerprint().clone()];
        members.extend(state.peers().iter().map(|p| p.fingerprint().clone()));
        Ok(SyncOffer {
            held: state.sync_state().clone(),
            members,
        })
    }

    /// Messages to push to a peer advertising `offer`. Messages of senders
    /// the peer does not know yet are held back until it learns them.
    pub(crate) async fn plan_for(&self, offer: &SyncOffer) -> Result<SyncPlan> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed);
        }
        let mut plan = SyncPlan::new(state.log(), &offer.held);
        plan.retain_senders(|sender| offer.knows(sender));
        Ok(plan)
    }

    pub(crate) async fn record_delivery(&self, peer: &Fingerprint, held: &SyncMap) {
        let mut state = self.inner.state.lock().await;
        if !state.closed {
            state.record_delivery(peer, held);
        }
    }

    /// Reserve `blob_id` for one inbound transfer. `None` while another
    /// session is already receiving it.
    pub(crate) fn claim_inbound_blob(&self, blob_id: BlobId) -> Option<InboundBlob> {
        let mut inbound = self
            .inner
            .inbound_blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !inbound.insert(blob_id) {
            return None;
        }
        Some(InboundBlob {
            room: self.inner.clone(),
            blob_id,
            partial: None,
        })
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.inner.id)
            .field("fingerprint", &self.fingerprint().as_str())
            .finish()
    }
}

/// Releases its blob reservation on drop. While a blob created by this
/// transfer is still partial, dropping the reservation also removes it, so
/// a session cut off mid-transfer leaves nothing for a retry to trip over.
pub(crate) struct InboundBlob {
    room: Arc<RoomInner>,
    blob_id: BlobId,
    partial: Option<Arc<dyn BlobStore>>,
}

impl InboundBlob {
    /// The blob is being written by this transfer into `store`.
    pub(crate) fn track_partial(&mut self, store: Arc<dyn BlobStore>) {
        self.partial = Some(store);
    }

    /// The blob is complete, or already cleaned up.
    pub(crate) fn settle(&mut self) {
        self.partial = None;
    }
}

impl Drop for InboundBlob {
    fn drop(&mut self) {
        self.room
            .inbound_blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.blob_id);

        let Some(store) = self.partial.take() else {
            return;
        };
        let blob_id = self.blob_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.delete(&blob_id).await {
                        debug!(blob = %blob_id, error = %e, "Partial blob cleanup failed");
                    }
                });
            }
            Err(_) => warn!(blob = %blob_id, "No runtime to remove partial blob"),
        }
    }
}
