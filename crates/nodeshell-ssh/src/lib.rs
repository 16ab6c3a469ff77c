//! # Nodeshell SSH Transport
//!
//! Pooled, authenticated SSH transports for reaching cluster nodes.
//!
//! Every node other than the control node is reached through a forwarded
//! stream on a pooled transport to the control node. Transports are keyed by
//! `(host, username)`, authenticated once, and shared by every command that
//! runs on that node.
//!
//! ```no_run
//! use nodeshell_ssh::{ConnectionPool, PoolConfig, Ssh2Connector, TransportFactory};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), nodeshell_ssh::TransportError> {
//! let factory = TransportFactory::new(Arc::new(Ssh2Connector::default()));
//! let pool = ConnectionPool::new(factory, Arc::new("10.0.0.1".to_string()), PoolConfig::default());
//!
//! let transport = pool.get("10.0.4.2", "core", Path::new("~/.ssh/id_rsa")).await?;
//! assert!(transport.info().is_proxied());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Private key loading and validation
pub mod credential;

/// Transport abstraction and the non-blocking channel model
pub mod transport;

/// Transport creation
pub mod factory;

/// Connection pool and management
pub mod pool;

/// SSH-specific error types
pub mod error;

/// libssh2-backed transport
#[cfg(feature = "ssh2")]
pub mod libssh2;

/// In-memory transports for tests
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use credential::{expand_key_path, validate_key, Credential};
pub use error::TransportError;
pub use factory::{Connector, TransportFactory};
pub use pool::{ConnectionPool, ControlNode, PoolConfig, PoolStats};
pub use transport::{
    wait_ready, Channel, ConnectionInfo, PoolKey, ReadState, SharedTransport, Transport, TransportType,
    TunnelStream, SSH_PORT,
};

#[cfg(feature = "ssh2")]
pub use libssh2::{Ssh2Connector, SshChannel, SshConfig, SshTransport};
