//! Transport creation: connect, tunnel, authenticate

use crate::{Credential, SharedTransport, Transport, TransportError, SSH_PORT};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Raw network primitive used by the [`TransportFactory`].
///
/// Implementations open unauthenticated transports; authentication is driven
/// separately through [`crate::Transport::authenticate`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a direct connection to `host:port`
    async fn connect(&self, host: &str, port: u16, username: &str) -> Result<SharedTransport, TransportError>;

    /// Open a connection to `host:port` tunnelled through `jump`
    async fn tunnel(
        &self,
        jump: SharedTransport,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<SharedTransport, TransportError>;
}

/// Opens and authenticates transports, directly or through a jump host
#[derive(Clone)]
pub struct TransportFactory {
    connector: Arc<dyn Connector>,
    port: u16,
}

impl TransportFactory {
    /// Create a factory on top of a connector
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            port: SSH_PORT,
        }
    }

    /// Use a port other than 22 for every host
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Port used for new connections
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open a raw transport to `host`.
    ///
    /// With `via` set, the connection is a forwarded stream opened on that
    /// (already authenticated) transport; otherwise it is a direct TCP
    /// connection. Unreachable hosts fail with [`TransportError::Connection`].
    pub async fn open_transport(
        &self,
        host: &str,
        username: &str,
        via: Option<SharedTransport>,
    ) -> Result<SharedTransport, TransportError> {
        match via {
            None => {
                debug!("Opening direct transport to {}:{}", host, self.port);
                self.connector.connect(host, self.port, username).await
            }
            Some(jump) => {
                debug!("Opening transport to {}:{} via {}", host, self.port, jump.info().host);
                self.connector.tunnel(jump, host, self.port, username).await
            }
        }
    }

    /// Run public-key authentication on `transport` and hand it back.
    ///
    /// The returned transport may be unauthenticated; check
    /// [`crate::Transport::is_authenticated`].
    pub async fn authenticate(
        &self,
        transport: SharedTransport,
        username: &str,
        credential: &Credential,
    ) -> Result<SharedTransport, TransportError> {
        transport.authenticate(username, credential).await?;
        Ok(transport)
    }

    /// Open and authenticate in one step.
    ///
    /// A rejected key closes the fresh transport and fails with
    /// [`TransportError::Authentication`].
    pub async fn create(
        &self,
        host: &str,
        username: &str,
        credential: &Credential,
        via: Option<SharedTransport>,
    ) -> Result<SharedTransport, TransportError> {
        let transport = self.open_transport(host, username, via).await?;

        let transport = match self.authenticate(transport.clone(), username, credential).await {
            Ok(transport) => transport,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        if !transport.is_authenticated() {
            warn!(
                "unable to authenticate {}@{} with key {}",
                username,
                host,
                credential.path().display()
            );
            transport.close();
            return Err(TransportError::Authentication {
                username: username.to_string(),
                host: host.to_string(),
                key_path: credential.path().to_path_buf(),
            });
        }

        info!("Authenticated {}", transport.info());
        Ok(transport)
    }
}
