//! Multi-node room tests over real sockets.
//!
//! Every node binds its own listeners on 127.0.0.1 and registers its
//! services in one shared `LoopbackDirectory`, so onion addresses resolve to
//! local ports. Workers run with a short interval to keep the tests fast.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;

use veil_core::{
    BroadcastNotifier, Command, Node, NodeConfig, PeerInfo, Received, Room, RoomEvent, Services,
};
use veil_net::{LoopbackDirectory, ServiceRegistrar};
use veil_shared::{ContentType, Fingerprint, Identity, Message};
use veil_store::{BlobStore, FsBlobStore, MemoryBlobStore};

struct TestNode {
    node: Node,
    contact: Fingerprint,
    blobs: Arc<dyn BlobStore>,
    events: broadcast::Receiver<RoomEvent>,
}

fn test_config() -> NodeConfig {
    NodeConfig {
        sync_interval: Duration::from_millis(100),
        max_backoff: Duration::from_millis(400),
        io_timeout: Duration::from_secs(5),
        ..NodeConfig::default()
    }
}

async fn spawn_node(directory: &Arc<LoopbackDirectory>) -> TestNode {
    spawn_node_with(directory, test_config()).await
}

async fn spawn_node_with(directory: &Arc<LoopbackDirectory>, config: NodeConfig) -> TestNode {
    spawn_node_on(directory, config, Arc::new(MemoryBlobStore::new(u64::MAX))).await
}

async fn spawn_node_on(
    directory: &Arc<LoopbackDirectory>,
    config: NodeConfig,
    blobs: Arc<dyn BlobStore>,
) -> TestNode {
    let notifier = Arc::new(BroadcastNotifier::new(1024));
    let events = notifier.subscribe();
    let services = Services::loopback(
        directory.clone(),
        blobs.clone(),
        notifier,
        Duration::from_secs(2),
    );
    let node = Node::start(config, services).await.unwrap();
    let contact = node.add_contact_identity().await.unwrap();
    TestNode {
        node,
        contact,
        blobs,
        events,
    }
}

/// Poll `check` until it holds, failing the test after ten seconds.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Invite `guest` into `room` and accept on the guest's side.
async fn join(host: &TestNode, room: &Room, guest: &TestNode) -> Room {
    host.node
        .invite_contact(room.id(), &guest.contact)
        .await
        .unwrap();
    wait_until("room request", || async move {
        guest
            .node
            .pending_requests()
            .iter()
            .any(|r| r.room_id() == room.id())
    })
    .await;
    let request = guest
        .node
        .pending_requests()
        .into_iter()
        .find(|r| r.room_id() == room.id())
        .unwrap();
    guest.node.accept_request(request.id()).await.unwrap()
}

async fn texts(room: &Room) -> Vec<Message> {
    room.messages()
        .await
        .into_iter()
        .filter(|m| m.content_type == ContentType::Text)
        .collect()
}

#[tokio::test]
async fn test_handshake_gives_each_side_one_peer() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;

    let room = alice.node.create_room("Plans").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    let (room, bob_room) = (&room, &bob_room);

    assert_eq!(bob_room.id(), room.id());
    assert!(!bob_room.is_admin().await);

    let alice_peers = room.peers().await;
    assert_eq!(alice_peers.len(), 1);
    assert_eq!(&alice_peers[0].fingerprint, bob_room.fingerprint());

    // The creator, here also the inviter, is an admin peer on the newcomer's side.
    let bob_peers = bob_room.peers().await;
    assert_eq!(bob_peers.len(), 1);
    assert_eq!(&bob_peers[0].fingerprint, room.fingerprint());
    assert!(bob_peers[0].is_admin);

    // History, including the invite naming bob, reaches bob's log.
    wait_until("room name", || async move { bob_room.name().await == "Plans" }).await;
    assert_eq!(bob_room.peers().await.len(), 1);

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_text_reaches_every_member_once() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;
    let carol = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    let carol_room = join(&alice, &room, &carol).await;
    let (room, bob_room, carol_room) = (&room, &bob_room, &carol_room);

    let sent = room.send_text("hello").await.unwrap();

    for member in [bob_room, carol_room] {
        wait_until("text delivery", || async move { !texts(member).await.is_empty() }).await;
    }

    // Bob learns carol from the invite, and the two also relay to each other.
    wait_until("bob knows carol", || async move {
        bob_room
            .peers()
            .await
            .iter()
            .any(|p| &p.fingerprint == carol_room.fingerprint())
    })
    .await;
    sleep(Duration::from_millis(500)).await;

    for member in [bob_room, carol_room] {
        let received = texts(member).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].signature, sent.signature);
        assert_eq!(received[0].text().unwrap(), "hello");
        assert_eq!(&received[0].sender, room.fingerprint());
    }

    for node in [&alice, &bob, &carol] {
        node.node.shutdown().await;
    }
}

#[tokio::test]
async fn test_newcomer_reply_reaches_earlier_members() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;
    let carol = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    let carol_room = join(&alice, &room, &carol).await;
    let (room, bob_room, carol_room) = (&room, &bob_room, &carol_room);

    wait_until("carol knows bob", || async move {
        carol_room
            .peers()
            .await
            .iter()
            .any(|p| &p.fingerprint == bob_room.fingerprint())
    })
    .await;

    carol_room.send_text("hi all").await.unwrap();
    for member in [room, bob_room] {
        wait_until("reply delivery", || async move {
            texts(member)
                .await
                .iter()
                .any(|m| &m.sender == carol_room.fingerprint())
        })
        .await;
    }

    for node in [&alice, &bob, &carol] {
        node.node.shutdown().await;
    }
}

#[tokio::test]
async fn test_nick_command_applies_once() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    let (room, bob_room) = (&room, &bob_room);

    let nick = bob_room.send_command(&Command::nick("Bob")).await.unwrap();
    assert_eq!(bob_room.self_nickname().await.as_deref(), Some("Bob"));

    wait_until("nickname", || async move {
        room.peers()
            .await
            .iter()
            .any(|p| p.nickname.as_deref() == Some("Bob"))
    })
    .await;

    let before = room.messages().await.len();
    let again = room
        .receive_message(nick, Some(bob_room.fingerprint()))
        .await
        .unwrap();
    assert_eq!(again, Received::Duplicate);
    assert_eq!(room.messages().await.len(), before);

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

fn admin_flag(peers: &[PeerInfo], fingerprint: &Fingerprint) -> Option<bool> {
    peers
        .iter()
        .find(|p| &p.fingerprint == fingerprint)
        .map(|p| p.is_admin)
}

#[tokio::test]
async fn test_member_invite_keeps_admin_set() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;
    let dave = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    // Bob is a plain member and brings dave in himself.
    let dave_room = join(&bob, &bob_room, &dave).await;
    let (room, bob_room, dave_room) = (&room, &bob_room, &dave_room);

    assert!(room.is_admin().await);
    assert!(!bob_room.is_admin().await);
    assert!(!dave_room.is_admin().await);

    let dave_peers = dave_room.peers().await;
    assert_eq!(admin_flag(&dave_peers, room.fingerprint()), Some(true));
    assert_eq!(admin_flag(&dave_peers, bob_room.fingerprint()), Some(false));
    assert_eq!(
        admin_flag(&room.peers().await, bob_room.fingerprint()),
        Some(false)
    );

    wait_until("alice knows dave", || async move {
        admin_flag(&room.peers().await, dave_room.fingerprint()).is_some()
    })
    .await;

    // Only the creator's promote counts, on every node.
    room.send_command(&Command::promote(dave_room.fingerprint()))
        .await
        .unwrap();
    wait_until("dave promoted", || async move { dave_room.is_admin().await }).await;
    wait_until("bob sees dave promoted", || async move {
        admin_flag(&bob_room.peers().await, dave_room.fingerprint()) == Some(true)
    })
    .await;

    let ousting = bob_room
        .send_command(&Command::remove_peer(room.fingerprint()))
        .await
        .unwrap();
    let signature = &ousting.signature;
    wait_until("dave logs bob's command", || async move {
        dave_room
            .messages()
            .await
            .iter()
            .any(|m| &m.signature == signature)
    })
    .await;
    assert_eq!(
        admin_flag(&dave_room.peers().await, room.fingerprint()),
        Some(true)
    );
    assert!(admin_flag(&bob_room.peers().await, room.fingerprint()).is_some());

    for node in [&alice, &bob, &dave] {
        node.node.shutdown().await;
    }
}

#[tokio::test]
async fn test_attachment_arrives_intact() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let dir = tempfile::tempdir().unwrap();
    let disk = FsBlobStore::new(dir.path().join("blobs"), u64::MAX)
        .await
        .unwrap();
    let bob = spawn_node_on(&directory, test_config(), Arc::new(disk)).await;

    let room = alice.node.create_room("").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    let bob_room = &bob_room;

    // Spans two blocks.
    let data: Vec<u8> = (0..600_000u32).map(|i| (i % 251) as u8).collect();
    let sent = room.attach(&data, Some("notes.bin")).await.unwrap();
    let file = sent.file_ref().unwrap();
    assert_eq!(file.file_name.as_deref(), Some("notes.bin"));

    wait_until("file message", || async move {
        bob_room
            .messages()
            .await
            .iter()
            .any(|m| m.content_type == ContentType::File)
    })
    .await;

    let mut received = Vec::new();
    let copied = bob
        .blobs
        .stream_to(&file.blob_id, &mut received)
        .await
        .unwrap();
    assert_eq!(copied, data.len() as u64);
    assert_eq!(received, data);

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_messages_wait_for_late_accept() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    alice
        .node
        .invite_contact(room.id(), &bob.contact)
        .await
        .unwrap();
    room.send_text("are you there?").await.unwrap();
    let bob_node = &bob.node;

    // Bob's room is not registered yet, so alice keeps retrying.
    wait_until("room request", || async move {
        !bob_node.pending_requests().is_empty()
    })
    .await;
    sleep(Duration::from_millis(300)).await;
    let request = bob.node.pending_requests().remove(0);
    let bob_room = bob.node.accept_request(request.id()).await.unwrap();

    let bob_room = &bob_room;
    wait_until("late delivery", || async move { !texts(bob_room).await.is_empty() }).await;

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_auto_accept_joins_without_asking() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node_with(
        &directory,
        NodeConfig {
            auto_accept: true,
            ..test_config()
        },
    )
    .await;

    let room = alice.node.create_room("").await.unwrap();
    alice
        .node
        .invite_contact(room.id(), &bob.contact)
        .await
        .unwrap();

    let (bob_node, room_id) = (&bob.node, room.id());
    wait_until("auto accept", || async move { bob_node.room(room_id).is_some() }).await;
    assert!(bob.node.pending_requests().is_empty());

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_reject_request_leaves_no_room() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let mut bob = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    alice
        .node
        .invite_contact(room.id(), &bob.contact)
        .await
        .unwrap();
    let bob_node = &bob.node;
    wait_until("room request", || async move {
        !bob_node.pending_requests().is_empty()
    })
    .await;

    let request = bob.node.pending_requests().remove(0);
    assert_eq!(request.inviter(), room.fingerprint());
    assert_eq!(request.contact(), &bob.contact);
    bob.node.reject_request(request.id()).unwrap();

    assert!(bob.node.pending_requests().is_empty());
    assert!(bob.node.room(room.id()).is_none());

    let mut announced = false;
    while let Ok(event) = bob.events.try_recv() {
        announced |= matches!(
            event,
            RoomEvent::NewRequest { room_id, .. } if room_id == room.id()
        );
    }
    assert!(announced);

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_unknown_contact_is_not_answered() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;

    // Bob's contact listener is reachable under a fingerprint it never
    // published, so the request is dropped unanswered.
    let stranger = veil_shared::ContactIdentity::generate();
    directory
        .register_service(
            stranger.as_self(),
            alice.node.config().contact_port,
            bob.node.contact_addr().port(),
        )
        .await
        .unwrap();

    let room = alice.node.create_room("").await.unwrap();
    let result = alice
        .node
        .invite_contact(room.id(), stranger.fingerprint())
        .await;
    assert!(result.is_err());
    assert!(room.peers().await.is_empty());
    assert!(bob.node.pending_requests().is_empty());

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_delete_room_stops_workers() {
    let directory = Arc::new(LoopbackDirectory::new());
    let alice = spawn_node(&directory).await;
    let bob = spawn_node(&directory).await;

    let room = alice.node.create_room("").await.unwrap();
    let bob_room = join(&alice, &room, &bob).await;
    assert_eq!(room.active_workers(), 1);
    assert_eq!(bob_room.active_workers(), 1);

    alice.node.delete_room(room.id()).await.unwrap();
    assert_eq!(room.active_workers(), 0);
    assert!(room.is_closed());
    assert!(room.send_text("anyone?").await.is_err());
    assert!(alice.node.rooms().is_empty());

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}
