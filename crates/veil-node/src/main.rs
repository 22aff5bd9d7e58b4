//! # veil-node
//!
//! Daemon hosting one Veil node.
//!
//! This binary:
//! - binds the **contact** and **conversation** listeners
//! - publishes a contact identity (persisted when `VEIL_IDENTITY_PATH` is set)
//!   so others can invite us into rooms
//! - stores attachments on disk under `VEIL_BLOB_PATH`
//! - logs every room event as a JSON line until Ctrl+C

mod config;
mod error;
mod keyfile;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veil_core::{BroadcastNotifier, Node, RoomEvent, Services};
use veil_net::LoopbackDirectory;
use veil_shared::ContactIdentity;
use veil_store::FsBlobStore;

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,veil_core=debug,veil_net=debug")),
        )
        .init();

    info!("Starting Veil node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = DaemonConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize services
    // -----------------------------------------------------------------------
    let blobs = Arc::new(
        FsBlobStore::new(config.blob_path.clone(), config.node.max_attachment_size).await?,
    );
    let notifier = Arc::new(BroadcastNotifier::default());
    let events = notifier.subscribe();

    // Onion services are registered in-process; dials to addresses that are
    // not registered go out as plain host:port connections.
    let directory = Arc::new(LoopbackDirectory::new());
    let services = Services::loopback(directory, blobs, notifier, config.connect_timeout);

    // -----------------------------------------------------------------------
    // 4. Start the node and publish the contact identity
    // -----------------------------------------------------------------------
    let node = Node::start(config.node.clone(), services).await?;

    let contact = match &config.identity_path {
        Some(path) => keyfile::load_or_create(path).await?.0,
        None => ContactIdentity::generate(),
    };
    let fingerprint = node.import_contact_identity(contact).await?;
    info!(
        contact = %fingerprint,
        address = %fingerprint.network_address(),
        "Contact identity ready"
    );

    // -----------------------------------------------------------------------
    // 5. Log events until shutdown
    // -----------------------------------------------------------------------
    let event_log = tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    node.shutdown().await;
    event_log.abort();
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<RoomEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => info!(target: "veil_node::events", "{line}"),
                Err(e) => warn!(error = %e, "Failed to encode event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
