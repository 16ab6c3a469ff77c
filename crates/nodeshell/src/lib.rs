//! # Nodeshell
//!
//! Run shell commands on cluster nodes over pooled, authenticated SSH
//! connections.
//!
//! Nodeshell keeps one authenticated transport per `(host, username)` and
//! opens a fresh channel on it for every command. Nodes other than the
//! control node are reached by hopping through it.
//!
//! ```no_run
//! use nodeshell::{CommandRunner, RunOptions, RunnerConfig};
//! use nodeshell::ssh::Ssh2Connector;
//! use std::sync::Arc;
//!
//! # async fn example() -> nodeshell::Result<()> {
//! let config = RunnerConfig::from_env()?.with_master("10.0.0.1");
//! let runner = CommandRunner::from_config(config, Arc::new(Ssh2Connector::default()))?;
//!
//! let (success, output) = runner
//!     .run_command_on_agent("10.0.3.7", "systemctl is-active docker", &RunOptions::new())
//!     .await
//!     .into_pair();
//! println!("{} {}", success, output);
//!
//! runner.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use nodeshell_ssh as ssh;

/// Error types for the Nodeshell library
pub mod error;

/// Runner configuration
pub mod config;

/// Cluster address lookup
pub mod topology;

/// Per-command sessions
pub mod session;

/// Command runner API
pub mod runner;

/// Local CLI invocation
pub mod local;

pub use config::RunnerConfig;
pub use error::{CommandError, Error};
pub use local::{run_cli_command, LocalOutput};
pub use runner::{CommandOutput, CommandRunner, CommandStatus, RunOptions};
pub use session::{RemoteSession, SessionConfig, SessionOutcome, NO_EXIT_STATUS};
pub use topology::{StaticTopology, Topology, TopologyControlNode};

/// Result type alias for Nodeshell operations
pub type Result<T> = std::result::Result<T, Error>;
