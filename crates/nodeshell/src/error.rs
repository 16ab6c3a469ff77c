//! Error types for the Nodeshell library

use nodeshell_ssh::TransportError;
use std::io;
use thiserror::Error;

/// Main error type for Nodeshell operations
#[derive(Debug, Error)]
pub enum Error {
    /// Connection, authentication or credential failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cluster address lookup failed
    #[error("Topology error: {0}")]
    Topology(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session has no transport to run on
    #[error("Not connected to {0}")]
    NotConnected(String),

    /// Session misuse, such as running a second command
    #[error("Session error: {0}")]
    Session(String),

    /// Local command errors
    #[error(transparent)]
    Command(#[from] CommandError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Error {
    /// True for unreachable hosts and timeouts
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_connection())
    }

    /// True when a key was rejected
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_authentication())
    }
}

/// Failure of a local CLI invocation
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started
    #[error("unable to run `{program}`: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The program exited non-zero and the caller asked for a check
    #[error("command exited with code {code}")]
    Failed {
        /// Exit code, -1 when terminated by a signal
        code: i32,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_transport_error_classification() {
        let refused: Error = TransportError::connection("10.255.255.1", 22, "connection refused").into();
        assert!(refused.is_connection());
        assert!(!refused.is_authentication());

        let timeout: Error = TransportError::Timeout(Duration::from_secs(60)).into();
        assert!(timeout.is_connection());

        let rejected: Error = TransportError::Authentication {
            username: "core".to_string(),
            host: "10.0.0.1".to_string(),
            key_path: PathBuf::from("/home/core/.ssh/id_rsa"),
        }
        .into();
        assert!(rejected.is_authentication());
        assert!(rejected.to_string().contains("core@10.0.0.1"));
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::Failed {
            code: 3,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "command exited with code 3");

        let wrapped: Error = err.into();
        assert_eq!(wrapped.to_string(), "command exited with code 3");
    }

    #[test]
    fn test_config_error_conversion() {
        let err: Error = config::ConfigError::Message("missing field".to_string()).into();
        assert!(matches!(err, Error::Config(msg) if msg == "missing field"));
    }
}
