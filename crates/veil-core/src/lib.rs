// Room engine: signed logs, peer workers, contact handshakes and sync sessions.

pub mod attachment;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod history;
pub mod node;
pub mod room;
pub mod services;
pub mod session;
pub mod state;
pub mod sync;
mod worker;

pub use commands::{Command, CommandRegistry, Effect};
pub use config::NodeConfig;
pub use error::{AttachmentError, CommandError, HandshakeError, Result, RoomError};
pub use events::{BroadcastNotifier, Notifier, NullNotifier, RoomEvent};
pub use node::{Node, RoomRequest};
pub use room::{Received, Room};
pub use services::Services;
pub use session::{ServeReport, SyncReport};
pub use state::PeerInfo;
pub use sync::SyncMap;
pub use worker::backoff_delay;
