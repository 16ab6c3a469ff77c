//! SSH-specific error types

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Host unreachable or refusing connections
    #[error("unable to connect to {host}:{port}: {message}")]
    Connection {
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Underlying failure
        message: String,
    },

    /// Connection established but the key/username pair was rejected
    #[error("unable to authenticate {username}@{host} with key {}", key_path.display())]
    Authentication {
        /// SSH username
        username: String,
        /// Target host
        host: String,
        /// Private key that was offered
        key_path: PathBuf,
    },

    /// Private key missing or unparseable
    #[error("invalid private key {}: {reason}", path.display())]
    Credential {
        /// Key file path
        path: PathBuf,
        /// Why the key was rejected
        reason: String,
    },

    /// Address lookup for a cluster role failed
    #[error("topology lookup failed: {0}")]
    Topology(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Pool operation exceeded its bound
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Channel-level failure on an established transport
    #[error("channel error: {0}")]
    Channel(String),

    /// Transport was closed underneath the caller
    #[error("transport to {0} is closed")]
    Closed(String),
}

impl TransportError {
    /// Build a connection error for `host:port`
    pub fn connection(host: &str, port: u16, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.to_string(),
            port,
            message: message.into(),
        }
    }

    /// True for failures that mean the host could not be reached at all
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_) | Self::Timeout(_))
    }

    /// True when the transport itself is unusable and must be replaced
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed(_))
    }

    /// True when the host was reached but rejected the credential
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// libssh2 code for a channel the peer refused to open
#[cfg(feature = "ssh2")]
const LIBSSH2_ERROR_CHANNEL_FAILURE: i32 = -21;

#[cfg(feature = "ssh2")]
impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_CHANNEL_FAILURE) => Self::Channel(err.message().to_string()),
            _ => Self::Io(err.into()),
        }
    }
}
