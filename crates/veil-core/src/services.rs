use std::sync::Arc;
use std::time::Duration;

use veil_net::{LoopbackDirectory, ServiceRegistrar, TcpTransport, Transport};
use veil_store::BlobStore;

use crate::commands::CommandRegistry;
use crate::events::Notifier;

/// External collaborators shared by the node and all of its rooms.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub registrar: Arc<dyn ServiceRegistrar>,
    pub blobs: Arc<dyn BlobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub commands: Arc<CommandRegistry>,
}

impl Services {
    /// Services with the built-in command set.
    pub fn new(
        transport: Arc<dyn Transport>,
        registrar: Arc<dyn ServiceRegistrar>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            transport,
            registrar,
            blobs,
            notifier,
            commands: Arc::new(CommandRegistry::with_builtins()),
        }
    }

    /// In-process wiring: dials are resolved through `directory`, which is
    /// also where services get registered.
    pub fn loopback(
        directory: Arc<LoopbackDirectory>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        connect_timeout: Duration,
    ) -> Self {
        let transport = TcpTransport::with_directory(directory.clone(), connect_timeout);
        Self::new(Arc::new(transport), directory, blobs, notifier)
    }

    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = Arc::new(commands);
        self
    }
}
