//! The node: contact identities, pending room requests and the set of rooms,
//! plus the two listeners that feed them.
//!
//! All rooms share one conversation listener; a session names its room in
//! the authentication step. Contact identities share the contact listener.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use veil_net::{FramedConnection, NetError};
use veil_shared::{
    ContactIdentity, Fingerprint, Identity, RemoteIdentity, RequestId, RoomId, SelfIdentity,
    Timestamp,
};

use crate::commands::Command;
use crate::config::NodeConfig;
use crate::error::{HandshakeError, Result, RoomError};
use crate::events::RoomEvent;
use crate::handshake::{self, AcceptedContact};
use crate::room::Room;
use crate::services::Services;
use crate::session::{self, ServeReport};
use crate::state::RoomState;

/// An invitation we answered but have not yet accepted or rejected.
#[derive(Debug, Clone)]
pub struct RoomRequest {
    id: RequestId,
    room_id: RoomId,
    contact: Fingerprint,
    inviter: RemoteIdentity,
    identity: SelfIdentity,
    admins: Vec<RemoteIdentity>,
    received_at: Timestamp,
}

impl RoomRequest {
    fn from_accepted(accepted: AcceptedContact) -> Self {
        Self {
            id: RequestId::new(),
            room_id: accepted.room_id,
            contact: accepted.contact,
            inviter: accepted.inviter,
            identity: accepted.identity,
            admins: accepted.admins,
            received_at: Timestamp::now(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// The contact identity the invitation was addressed to.
    pub fn contact(&self) -> &Fingerprint {
        &self.contact
    }

    pub fn inviter(&self) -> &Fingerprint {
        self.inviter.fingerprint()
    }

    /// Room admins as named by the inviter.
    pub fn admins(&self) -> impl Iterator<Item = &Fingerprint> {
        self.admins.iter().map(RemoteIdentity::fingerprint)
    }

    /// The room identity minted for us during the handshake.
    pub fn fingerprint(&self) -> &Fingerprint {
        self.identity.fingerprint()
    }

    pub fn received_at(&self) -> Timestamp {
        self.received_at
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Contact,
    Conversation,
}

/// Handle to a running node. Clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: Arc<NodeConfig>,
    services: Services,
    contact_addr: SocketAddr,
    conversation_addr: SocketAddr,
    contacts: RwLock<HashMap<Fingerprint, ContactIdentity>>,
    rooms: RwLock<HashMap<RoomId, Room>>,
    requests: Mutex<HashMap<RequestId, RoomRequest>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Node {
    /// Bind both listeners and start accepting connections.
    pub async fn start(config: NodeConfig, services: Services) -> Result<Self> {
        let contact_listener = TcpListener::bind(config.contact_listen)
            .await
            .map_err(NetError::from)?;
        let conversation_listener = TcpListener::bind(config.conversation_listen)
            .await
            .map_err(NetError::from)?;

        let inner = NodeInner {
            contact_addr: contact_listener.local_addr().map_err(NetError::from)?,
            conversation_addr: conversation_listener.local_addr().map_err(NetError::from)?,
            config: Arc::new(config),
            services,
            contacts: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        };
        let node = Self {
            inner: Arc::new(inner),
        };
        node.spawn_listeners(contact_listener, conversation_listener);

        info!(
            contact = %node.inner.contact_addr,
            conversation = %node.inner.conversation_addr,
            "Node started"
        );
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Local socket of the contact listener.
    pub fn contact_addr(&self) -> SocketAddr {
        self.inner.contact_addr
    }

    /// Local socket of the conversation listener.
    pub fn conversation_addr(&self) -> SocketAddr {
        self.inner.conversation_addr
    }

    // ---- contacts ---------------------------------------------------------

    /// Generate a contact identity and publish it on the contact endpoint.
    pub async fn add_contact_identity(&self) -> Result<Fingerprint> {
        self.import_contact_identity(ContactIdentity::generate())
            .await
    }

    /// Publish an existing contact identity (e.g. restored from an export).
    pub async fn import_contact_identity(&self, identity: ContactIdentity) -> Result<Fingerprint> {
        self.inner
            .services
            .registrar
            .register_service(
                identity.as_self(),
                self.inner.config.contact_port,
                self.inner.contact_addr.port(),
            )
            .await?;

        let fingerprint = identity.fingerprint().clone();
        write_lock(&self.inner.contacts).insert(fingerprint.clone(), identity);
        info!(contact = %fingerprint.short(), "Contact identity published");
        Ok(fingerprint)
    }

    pub fn contact_identities(&self) -> Vec<Fingerprint> {
        read_lock(&self.inner.contacts).keys().cloned().collect()
    }

    fn contact(&self, fingerprint: &Fingerprint) -> Option<ContactIdentity> {
        read_lock(&self.inner.contacts).get(fingerprint).cloned()
    }

    // ---- rooms ------------------------------------------------------------

    /// Create a room with ourselves as its only (admin) member. A non-empty
    /// name is published as a `name_room` command.
    pub async fn create_room(&self, name: &str) -> Result<Room> {
        let identity = SelfIdentity::generate();
        let state = RoomState::new(RoomId::new(), identity.fingerprint().clone(), true);
        let room = self.install_room(identity, state).await?;

        if !name.trim().is_empty() {
            room.send_command(&Command::name_room(name.trim())).await?;
        }
        self.notify(RoomEvent::NewRoom {
            room_id: room.id(),
            name: room.name().await,
        });
        info!(room = %room.id(), "Room created");
        Ok(room)
    }

    /// Bring `contact` into the room: run the contact handshake against its
    /// contact endpoint, then post an `invite` naming the new member and
    /// every existing peer so the newcomer learns the whole room. Returns
    /// the newcomer's room fingerprint.
    pub async fn invite_contact(&self, room_id: RoomId, contact: &Fingerprint) -> Result<Fingerprint> {
        let room = self.room(room_id).ok_or(RoomError::RoomNotFound(room_id))?;
        let config = &self.inner.config;

        let admins = room.admins().await;
        let handshake = async {
            let stream = self
                .inner
                .services
                .transport
                .dial(&contact.network_address(), config.contact_port)
                .await?;
            let mut conn = FramedConnection::with_label(stream, contact.short());
            let result = handshake::initiate(&mut conn, room.identity(), contact, &room_id, &admins).await;
            if let Err(e) = conn.close().await {
                trace!(contact = %contact.short(), error = %e, "Close after handshake failed");
            }
            result
        };
        let peer = match tokio::time::timeout(config.io_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(HandshakeError::Net(NetError::Timeout(config.io_timeout)).into()),
        };

        let mut members = vec![peer.fingerprint().clone()];
        members.extend(
            room.peers()
                .await
                .into_iter()
                .map(|p| p.fingerprint)
                .filter(|fp| fp != peer.fingerprint()),
        );
        room.send_command(&Command::invite_all(&members)).await?;

        info!(
            room = %room_id,
            contact = %contact.short(),
            peer = %peer.fingerprint().short(),
            "Contact invited"
        );
        Ok(peer.fingerprint().clone())
    }

    pub fn pending_requests(&self) -> Vec<RoomRequest> {
        let mut requests: Vec<RoomRequest> =
            lock(&self.inner.requests).values().cloned().collect();
        requests.sort_by_key(|r| r.received_at);
        requests
    }

    /// Join the room of a pending request. The inviter and the admins it
    /// named become our first peers; only the named admins hold admin
    /// rights, so the inviter is an admin here only if it is one in the room.
    pub async fn accept_request(&self, id: RequestId) -> Result<Room> {
        let request = lock(&self.inner.requests)
            .remove(&id)
            .ok_or(RoomError::RequestNotFound(id))?;

        let room_id = request.room_id;
        let inviter = request.inviter.fingerprint().clone();
        let mut state = RoomState::new(room_id, request.identity.fingerprint().clone(), false);
        for admin in request.admins {
            state.add_peer(admin, true);
        }
        state.add_peer(request.inviter, false);
        let room = self.install_room(request.identity, state).await?;

        self.notify(RoomEvent::NewRoom {
            room_id,
            name: String::new(),
        });
        info!(room = %room_id, inviter = %inviter.short(), "Room request accepted");
        Ok(room)
    }

    pub fn reject_request(&self, id: RequestId) -> Result<()> {
        let request = lock(&self.inner.requests)
            .remove(&id)
            .ok_or(RoomError::RequestNotFound(id))?;
        info!(room = %request.room_id, request = %id, "Room request rejected");
        Ok(())
    }

    pub fn room(&self, id: RoomId) -> Option<Room> {
        read_lock(&self.inner.rooms).get(&id).cloned()
    }

    pub fn rooms(&self) -> Vec<Room> {
        read_lock(&self.inner.rooms).values().cloned().collect()
    }

    /// Stop the room's workers, wait for them, then withdraw its service.
    pub async fn delete_room(&self, id: RoomId) -> Result<()> {
        let room = write_lock(&self.inner.rooms)
            .remove(&id)
            .ok_or(RoomError::RoomNotFound(id))?;
        self.retire_room(&room).await;
        self.notify(RoomEvent::RoomDeleted { room_id: id });
        info!(room = %id, "Room deleted");
        Ok(())
    }

    async fn install_room(&self, identity: SelfIdentity, state: RoomState) -> Result<Room> {
        let room_id = state.id();
        if read_lock(&self.inner.rooms).contains_key(&room_id) {
            return Err(RoomError::RoomExists(room_id));
        }

        self.inner
            .services
            .registrar
            .register_service(
                &identity,
                self.inner.config.conversation_port,
                self.inner.conversation_addr.port(),
            )
            .await?;

        let room = Room::new(
            identity,
            state,
            self.inner.services.clone(),
            self.inner.config.clone(),
            self.inner.cancel.child_token(),
        );
        let inserted = {
            let mut rooms = write_lock(&self.inner.rooms);
            match rooms.entry(room_id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(room.clone());
                    true
                }
            }
        };
        if !inserted {
            self.withdraw(&room).await;
            return Err(RoomError::RoomExists(room_id));
        }
        room.start().await;
        Ok(room)
    }

    async fn retire_room(&self, room: &Room) {
        room.shutdown().await;
        self.withdraw(room).await;
    }

    async fn withdraw(&self, room: &Room) {
        if let Err(e) = self
            .inner
            .services
            .registrar
            .deregister_service(&room.network_address())
            .await
        {
            warn!(room = %room.id(), error = %e, "Failed to deregister room service");
        }
    }

    // ---- inbound connections ----------------------------------------------

    /// Answer one connection on the contact endpoint. A valid request for
    /// one of our contact identities becomes a pending [`RoomRequest`], or a
    /// room right away when `auto_accept` is set.
    pub async fn serve_contact<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let timeout = self.inner.config.io_timeout;
        let mut conn = FramedConnection::with_label(stream, "contact");
        let outcome = tokio::time::timeout(
            timeout,
            handshake::respond(&mut conn, |target| self.contact(target)),
        )
        .await;
        if let Err(e) = conn.close().await {
            trace!(error = %e, "Close after contact request failed");
        }
        let accepted = match outcome {
            Ok(accepted) => accepted?,
            Err(_) => return Err(HandshakeError::Net(NetError::Timeout(timeout)).into()),
        };
        let Some(accepted) = accepted else {
            return Ok(());
        };

        if self.room(accepted.room_id).is_some() {
            debug!(room = %accepted.room_id, "Ignoring invitation to a room we already hold");
            return Ok(());
        }

        let request = RoomRequest::from_accepted(accepted);
        let id = request.id;
        self.notify(RoomEvent::NewRequest {
            request_id: id,
            room_id: request.room_id,
            inviter: request.inviter().clone(),
        });
        lock(&self.inner.requests).insert(id, request);

        if self.inner.config.auto_accept {
            self.accept_request(id).await?;
        }
        Ok(())
    }

    /// Serve one sync session on the conversation endpoint.
    pub async fn serve_conversation<S>(&self, stream: S) -> Result<ServeReport>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let timeout = self.inner.config.io_timeout;
        let mut conn = FramedConnection::with_label(stream, "conversation");
        let outcome = match tokio::time::timeout(
            timeout,
            session::serve(&mut conn, |id| self.room(*id)),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(NetError::Timeout(timeout).into()),
        };
        if let Err(e) = conn.close().await {
            trace!(error = %e, "Close after sync session failed");
        }
        outcome
    }

    fn spawn_listeners(&self, contact: TcpListener, conversation: TcpListener) {
        let handles = [
            (contact, Endpoint::Contact),
            (conversation, Endpoint::Conversation),
        ]
        .map(|(listener, endpoint)| {
            tokio::spawn(accept_loop(
                Arc::downgrade(&self.inner),
                listener,
                endpoint,
                self.inner.cancel.clone(),
            ))
        });
        lock(&self.inner.listeners).extend(handles);
    }

    /// Stop the listeners, close every room and withdraw every service.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let listeners: Vec<JoinHandle<()>> = lock(&self.inner.listeners).drain(..).collect();
        for listener in listeners {
            if let Err(e) = listener.await {
                warn!(error = %e, "Listener task failed");
            }
        }

        let rooms: Vec<Room> = write_lock(&self.inner.rooms)
            .drain()
            .map(|(_, room)| room)
            .collect();
        join_all(rooms.iter().map(|room| self.retire_room(room))).await;

        let contacts: Vec<ContactIdentity> = write_lock(&self.inner.contacts)
            .drain()
            .map(|(_, contact)| contact)
            .collect();
        for contact in &contacts {
            if let Err(e) = self
                .inner
                .services
                .registrar
                .deregister_service(&contact.network_address())
                .await
            {
                warn!(contact = %contact.fingerprint().short(), error = %e, "Failed to deregister contact service");
            }
        }

        info!(rooms = rooms.len(), contacts = contacts.len(), "Node stopped");
    }

    fn notify(&self, event: RoomEvent) {
        self.inner.services.notifier.notify(event);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("contact_addr", &self.inner.contact_addr)
            .field("conversation_addr", &self.inner.conversation_addr)
            .field("rooms", &read_lock(&self.inner.rooms).len())
            .finish()
    }
}

async fn accept_loop(
    node: Weak<NodeInner>,
    listener: TcpListener,
    endpoint: Endpoint,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(endpoint = ?endpoint, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(inner) = node.upgrade() else {
            break;
        };
        let node = Node { inner };
        trace!(endpoint = ?endpoint, remote = %remote, "Connection accepted");

        tokio::spawn(async move {
            let result = match endpoint {
                Endpoint::Contact => node.serve_contact(stream).await,
                Endpoint::Conversation => node.serve_conversation(stream).await.map(|_| ()),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_transport() => {
                    debug!(endpoint = ?endpoint, remote = %remote, error = %e, "Connection dropped")
                }
                Err(e) => warn!(endpoint = ?endpoint, remote = %remote, error = %e, "Connection failed"),
            }
        });
    }
    debug!(endpoint = ?endpoint, "Listener stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
