//! Command runner: the public surface for running commands on cluster nodes

use crate::session::{RemoteSession, SessionOutcome};
use crate::topology::{StaticTopology, Topology, TopologyControlNode};
use crate::{Result, RunnerConfig};
use nodeshell_ssh::{ConnectionPool, Connector, TransportFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-call overrides of the runner defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// SSH username; the configured default when `None`
    pub username: Option<String>,
    /// Private key; the configured default when `None`
    pub key_path: Option<PathBuf>,
    /// Echo the command and its output to stdout
    pub noisy: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            username: None,
            key_path: None,
            noisy: true,
        }
    }
}

impl RunOptions {
    /// Options that use every default
    pub fn new() -> Self {
        Self::default()
    }

    /// Run as `username`
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Authenticate with the key at `key_path`
    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Enable or disable echo
    pub fn with_noisy(mut self, noisy: bool) -> Self {
        self.noisy = noisy;
        self
    }

    /// Options with echo disabled
    pub fn quiet() -> Self {
        Self::default().with_noisy(false)
    }
}

/// `(success, output)` result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Combined output
    pub output: String,
}

impl CommandOutput {
    /// Result of a command that could not be run
    pub fn failed() -> Self {
        Self::default()
    }

    /// Split into the `(success, output)` pair
    pub fn into_pair(self) -> (bool, String) {
        (self.success, self.output)
    }
}

/// `(success, output, exit_code)` result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Combined output
    pub output: String,
    /// Remote exit status, -1 if none was reported
    pub exit_code: i32,
}

impl From<SessionOutcome> for CommandStatus {
    fn from(outcome: SessionOutcome) -> Self {
        Self {
            success: outcome.success(),
            output: outcome.output_lossy(),
            exit_code: outcome.exit_status,
        }
    }
}

impl From<CommandStatus> for CommandOutput {
    fn from(status: CommandStatus) -> Self {
        Self {
            success: status.success,
            output: status.output,
        }
    }
}

/// Runs commands on cluster nodes through a shared [`ConnectionPool`].
///
/// Failures to reach or authenticate to a node are logged and reported as an
/// unsuccessful result with empty output; they are never returned as errors.
pub struct CommandRunner {
    pool: Arc<ConnectionPool>,
    topology: Arc<dyn Topology>,
    config: RunnerConfig,
}

impl CommandRunner {
    /// Create a runner over an existing pool and topology
    pub fn new(pool: Arc<ConnectionPool>, topology: Arc<dyn Topology>, config: RunnerConfig) -> Self {
        Self { pool, topology, config }
    }

    /// Build the pool and a [`StaticTopology`] from `config`
    pub fn from_config(config: RunnerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let topology: Arc<dyn Topology> = Arc::new(StaticTopology::from_config(&config)?);
        let factory = TransportFactory::new(connector).with_port(config.ssh_port);
        let pool = ConnectionPool::new(
            factory,
            Arc::new(TopologyControlNode(Arc::clone(&topology))),
            config.pool_config(),
        );
        Ok(Self::new(Arc::new(pool), topology, config))
    }

    /// The shared connection pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Runner defaults
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `command` on `host`
    pub async fn run_command(&self, host: &str, command: &str, options: &RunOptions) -> CommandOutput {
        self.run_command_with_status(host, command, options).await.into()
    }

    /// Run `command` on `host` and keep the exit code
    pub async fn run_command_with_status(&self, host: &str, command: &str, options: &RunOptions) -> CommandStatus {
        let username = options.username.as_deref().unwrap_or(&self.config.username);
        let key_path = options
            .key_path
            .clone()
            .unwrap_or_else(|| self.config.key_path.clone());
        let config = self.config.session_config().with_noisy(options.noisy);

        let mut session = RemoteSession::open(&self.pool, host, username, &key_path, config).await;
        session.execute(command).await.into()
    }

    /// Run `command` on the control node
    pub async fn run_command_on_master(&self, command: &str, options: &RunOptions) -> CommandOutput {
        match self.topology.control_node_address().await {
            Ok(host) => self.run_command(&host, command, options).await,
            Err(e) => unresolved("control node", e),
        }
    }

    /// Run `command` on the leader
    pub async fn run_command_on_leader(&self, command: &str, options: &RunOptions) -> CommandOutput {
        match self.topology.leader_node_address().await {
            Ok(host) => self.run_command(&host, command, options).await,
            Err(e) => unresolved("leader", e),
        }
    }

    /// Run `command` on the application (Marathon) leader
    pub async fn run_command_on_marathon_leader(&self, command: &str, options: &RunOptions) -> CommandOutput {
        match self.topology.app_leader_address().await {
            Ok(host) => self.run_command(&host, command, options).await,
            Err(e) => unresolved("marathon leader", e),
        }
    }

    /// Run `command` on an agent; agents are always reached through the
    /// control node
    pub async fn run_command_on_agent(&self, host: &str, command: &str, options: &RunOptions) -> CommandOutput {
        self.run_command(host, command, options).await
    }

    /// Close every pooled connection; the next command reconnects
    pub async fn purge_connections(&self) -> Result<usize> {
        Ok(self.pool.purge(None).await?)
    }

    /// Close every pooled connection at the end of a run
    pub async fn shutdown(&self) -> Result<usize> {
        info!("Shutting down command runner");
        Ok(self.pool.shutdown().await?)
    }
}

fn unresolved(role: &str, err: crate::Error) -> CommandOutput {
    warn!("unable to resolve {} address: {}", role, err);
    CommandOutput::failed()
}
