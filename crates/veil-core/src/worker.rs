//! One delivery worker per peer.
//!
//! The worker sleeps for the sync interval (longer after failures), wakes
//! early when the room posts or receives something new, and runs a sync
//! session whenever the peer may lack messages we hold. It observes
//! cancellation while sleeping and between sessions.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veil_shared::{Identity, RemoteIdentity};

use crate::error::RoomError;
use crate::events::RoomEvent;
use crate::room::{Room, RoomInner};
use crate::session;

/// Owner's side of a running worker.
pub(crate) struct WorkerHandle {
    wake: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Run the next sync now. A wake sent while a session is running is kept
    /// for the following iteration.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to exit.
    pub(crate) async fn join(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(error = %e, "Peer worker panicked");
            }
        }
    }
}

pub(crate) fn spawn(
    room: Weak<RoomInner>,
    peer: RemoteIdentity,
    cancel: CancellationToken,
) -> WorkerHandle {
    let wake = Arc::new(Notify::new());
    let task = tokio::spawn(run(room, peer, wake.clone(), cancel.clone()));
    WorkerHandle { wake, cancel, task }
}

/// Delay before the next tick after `failures` consecutive failed sessions:
/// the interval, doubled per failure, capped at `max_backoff`.
pub fn backoff_delay(interval: Duration, max_backoff: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 1u32 << failures.min(16);
    interval
        .saturating_mul(factor)
        .min(max_backoff.max(interval))
}

async fn run(
    room: Weak<RoomInner>,
    peer: RemoteIdentity,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let label = peer.fingerprint().short().to_string();
    debug!(peer = %label, "Peer worker started");
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(inner) = room.upgrade() else {
            break;
        };
        let room = Room::from_inner(inner);
        let interval = room.config().sync_interval;
        let max_backoff = room.config().max_backoff;

        if room.needs_sync(peer.fingerprint()).await {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = session::push_to_peer(&room, &peer) => match outcome {
                    Ok(report) => {
                        failures = 0;
                        debug!(
                            room = %room.id(),
                            peer = %label,
                            sent = report.sent,
                            attachments = report.attachments,
                            "Sync completed"
                        );
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        report_failure(&room, &label, &e, failures);
                    }
                },
            }
        }
        drop(room);

        let delay = backoff_delay(interval, max_backoff, failures);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(peer = %label, "Peer worker stopped");
}

fn report_failure(room: &Room, peer: &str, error: &RoomError, failures: u32) {
    if error.is_transport() {
        debug!(room = %room.id(), peer, failures, error = %error, "Sync failed, will retry");
        return;
    }
    warn!(room = %room.id(), peer, failures, error = %error, "Sync failed");
    if error.is_untrusted() {
        room.notify(RoomEvent::Error {
            room_id: Some(room.id()),
            error: error.to_string(),
        });
    }
}
