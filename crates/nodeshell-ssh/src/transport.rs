//! Transport abstraction and the non-blocking channel model

use crate::{Credential, TransportError};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

/// Default SSH port
pub const SSH_PORT: u16 = 22;

/// An authenticated, reusable connection to one host under one username.
///
/// Transports are shared between concurrent sessions through `Arc`. Opening a
/// channel must be safe from several tasks at once; closing is reserved for the
/// connection pool and must be idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get connection information
    fn info(&self) -> &ConnectionInfo;

    /// Authenticate with a private key.
    ///
    /// A rejected key is not an error: it leaves [`is_authenticated`] false and
    /// the caller decides what to do with the transport. Errors are reserved for
    /// broken connections.
    ///
    /// [`is_authenticated`]: Transport::is_authenticated
    async fn authenticate(&self, username: &str, credential: &Credential) -> Result<(), TransportError>;

    /// Whether public-key authentication succeeded
    fn is_authenticated(&self) -> bool;

    /// Whether the underlying connection is still usable
    fn is_active(&self) -> bool;

    /// Try to open a command channel. `Pending` means try again later.
    fn open_channel(&self) -> Result<Poll<Box<dyn Channel>>, TransportError>;

    /// Try to open a forwarded stream to `host:port` through this transport.
    fn open_tunnel(&self, host: &str, port: u16) -> Result<Poll<Box<dyn TunnelStream>>, TransportError>;

    /// Close the connection. Only the first call has an effect.
    fn close(&self);

    /// Whether [`close`](Transport::close) has been called
    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("info", self.info())
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outcome of one non-blocking read on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// `n` bytes were written into the buffer
    Data(usize),
    /// Nothing ready yet; the channel is still open
    Pending,
    /// The remote side closed its output and everything has been read
    Closed,
}

/// A single command-execution stream multiplexed over a [`Transport`].
///
/// All operations are non-blocking. The driver is expected to retry `Pending`
/// results on its own schedule.
pub trait Channel: Send {
    /// Submit the command for execution
    fn exec(&mut self, command: &str) -> Result<Poll<()>, TransportError>;

    /// Read whatever output is ready
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadState, TransportError>;

    /// Close the channel and collect the exit status.
    ///
    /// Resolves to `None` if the remote side never reported one.
    fn finish(&mut self) -> Result<Poll<Option<i32>>, TransportError>;

    /// Release the channel without waiting. Safe to call more than once.
    fn close(&mut self);
}

/// A raw byte stream forwarded through a jump host
pub trait TunnelStream: io::Read + io::Write + Send {
    /// Whether the far end has sent EOF
    fn is_eof(&self) -> bool;
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Jump host this connection is tunnelled through, if any
    pub jump_host: Option<String>,
    /// Connection type
    pub transport_type: TransportType,
}

impl ConnectionInfo {
    /// Direct connection info
    pub fn direct(host: &str, port: u16, username: &str, transport_type: TransportType) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            jump_host: None,
            transport_type,
        }
    }

    /// Connection info for a transport tunnelled through `jump_host`
    pub fn proxied(
        host: &str,
        port: u16,
        username: &str,
        jump_host: &str,
        transport_type: TransportType,
    ) -> Self {
        Self {
            jump_host: Some(jump_host.to_string()),
            ..Self::direct(host, port, username, transport_type)
        }
    }

    /// Whether this connection goes through a jump host
    pub fn is_proxied(&self) -> bool {
        self.jump_host.is_some()
    }

    /// Pool key for this connection
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.host, &self.username)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)?;
        if let Some(jump) = &self.jump_host {
            write!(f, " via {}", jump)?;
        }
        Ok(())
    }
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with libssh2
    SshLibssh2,
    /// In-process transport (for testing)
    Local,
}

/// Cache identity of a pooled transport: one entry per (host, username)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    host: String,
    username: String,
}

impl PoolKey {
    /// Create a new pool key
    pub fn new(host: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
        }
    }

    /// Host part
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Username part
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.host)
    }
}

/// Retry a non-blocking operation every `interval` until it is ready.
pub async fn wait_ready<T, F>(interval: Duration, mut op: F) -> Result<T, TransportError>
where
    F: FnMut() -> Result<Poll<T>, TransportError>,
{
    loop {
        match op()? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending => tokio::time::sleep(interval).await,
        }
    }
}

/// Shared handle to a pooled transport
pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_pool_key_identity() {
        let a = PoolKey::new("10.0.0.1", "core");
        let b = PoolKey::new("10.0.0.1", "core");
        let c = PoolKey::new("10.0.0.1", "root");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "core@10.0.0.1");
        assert_eq!(a.host(), "10.0.0.1");
        assert_eq!(a.username(), "core");
    }

    #[test]
    fn test_pool_key_does_not_collide_on_separator() {
        let a = PoolKey::new("b@c", "a");
        let b = PoolKey::new("c", "a@b");
        assert_eq!(a.to_string(), b.to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_info() {
        let direct = ConnectionInfo::direct("master", 22, "core", TransportType::SshLibssh2);
        assert!(!direct.is_proxied());
        assert_eq!(direct.to_string(), "core@master:22");
        assert_eq!(direct.pool_key(), PoolKey::new("master", "core"));

        let proxied = ConnectionInfo::proxied("agent", 22, "core", "master", TransportType::Local);
        assert!(proxied.is_proxied());
        assert_eq!(proxied.to_string(), "core@agent:22 via master");
        assert_eq!(proxied.transport_type, TransportType::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_retries_until_ready() {
        let mut calls = 0;
        let value = wait_ready(Duration::from_millis(10), || {
            calls += 1;
            if calls < 4 {
                Ok(Poll::Pending)
            } else {
                Ok(Poll::Ready(calls))
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn test_wait_ready_propagates_errors() {
        let result: Result<(), _> = wait_ready(Duration::from_millis(1), || {
            Err(TransportError::Channel("broken".to_string()))
        })
        .await;

        assert!(matches!(result, Err(TransportError::Channel(_))));
    }
}
