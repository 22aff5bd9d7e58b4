//! Transport provider and service registrar capabilities.
//!
//! The engine never talks to the anonymizing network directly. It dials
//! through a [`Transport`] and publishes its listeners through a
//! [`ServiceRegistrar`]; both are injected. [`TcpTransport`] together with
//! [`LoopbackDirectory`] is the in-process implementation used by the daemon
//! and the integration tests: services are registered against local socket
//! addresses and dials to a registered onion address are routed there.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use veil_shared::{Identity, NetworkAddress, SelfIdentity};

use crate::error::{NetError, Result};

/// Any duplex byte stream a transport can hand out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound streams to `address:port`. May route through a proxy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, address: &NetworkAddress, port: u16) -> Result<BoxedStream>;
}

/// Exposes a local listener under an identity's derived network address.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    async fn register_service(
        &self,
        identity: &SelfIdentity,
        public_port: u16,
        local_port: u16,
    ) -> Result<()>;

    async fn deregister_service(&self, address: &NetworkAddress) -> Result<()>;
}

/// Run `fut` with a deadline, mapping expiry to [`NetError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(NetError::Timeout(limit)),
    }
}

/// In-process service table: `(onion address, public port) -> local socket`.
#[derive(Debug)]
pub struct LoopbackDirectory {
    host: IpAddr,
    services: RwLock<HashMap<(NetworkAddress, u16), SocketAddr>>,
}

impl LoopbackDirectory {
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn with_host(host: IpAddr) -> Self {
        Self {
            host,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, address: &NetworkAddress, port: u16) -> Option<SocketAddr> {
        self.services
            .read()
            .ok()
            .and_then(|map| map.get(&(address.clone(), port)).copied())
    }

    pub fn service_count(&self) -> usize {
        self.services.read().map(|map| map.len()).unwrap_or(0)
    }
}

impl Default for LoopbackDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistrar for LoopbackDirectory {
    async fn register_service(
        &self,
        identity: &SelfIdentity,
        public_port: u16,
        local_port: u16,
    ) -> Result<()> {
        let address = identity.network_address();
        let local = SocketAddr::new(self.host, local_port);
        let mut map = self
            .services
            .write()
            .map_err(|_| NetError::UnknownService("directory lock poisoned".to_string()))?;
        map.insert((address.clone(), public_port), local);
        info!(
            address = %address,
            public_port,
            local = %local,
            "Registered service"
        );
        Ok(())
    }

    async fn deregister_service(&self, address: &NetworkAddress) -> Result<()> {
        let mut map = self
            .services
            .write()
            .map_err(|_| NetError::UnknownService("directory lock poisoned".to_string()))?;
        let before = map.len();
        map.retain(|(addr, _), _| addr != address);
        debug!(address = %address, removed = before - map.len(), "Deregistered service");
        Ok(())
    }
}

/// Plain TCP dialer. Addresses registered in the directory are dialed on
/// their local socket; anything else is dialed as `host:port`, which only
/// resolves onion names when the process runs behind a Tor-aware resolver.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    directory: Option<Arc<LoopbackDirectory>>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            directory: None,
            connect_timeout,
        }
    }

    pub fn with_directory(directory: Arc<LoopbackDirectory>, connect_timeout: Duration) -> Self {
        Self {
            directory: Some(directory),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, address: &NetworkAddress, port: u16) -> Result<BoxedStream> {
        let local = self
            .directory
            .as_ref()
            .and_then(|dir| dir.resolve(address, port));

        let stream = match local {
            Some(socket) => {
                debug!(address = %address, port, local = %socket, "Dialing registered service");
                with_timeout(self.connect_timeout, async {
                    Ok(TcpStream::connect(socket).await?)
                })
                .await?
            }
            None => {
                debug!(address = %address, port, "Dialing remote service");
                with_timeout(self.connect_timeout, async {
                    Ok(TcpStream::connect((address.as_str(), port)).await?)
                })
                .await?
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
