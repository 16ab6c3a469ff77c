//! Runner configuration: defaults, JSON files and environment overrides

use crate::session::SessionConfig;
use crate::Result;
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File, FileFormat};
use nodeshell_ssh::{PoolConfig, SSH_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of the environment overrides: `NODESHELL_MASTER`,
/// `NODESHELL_KEY_PATH`, and so on for every field
pub const ENV_PREFIX: &str = "NODESHELL";

/// Defaults applied to every command the runner issues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// SSH username when a call does not name one
    pub username: String,
    /// Private key when a call does not name one; `~` is expanded
    pub key_path: PathBuf,
    /// Control node address
    pub master: Option<String>,
    /// Leader address; falls back to the control node
    pub leader: Option<String>,
    /// Application (Marathon) leader address; falls back to the control node
    pub app_leader: Option<String>,
    /// Echo commands and output to stdout
    pub noisy: bool,
    /// Drain poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Bytes read per drain step
    pub read_chunk_size: usize,
    /// Bound on pool acquisition in seconds; `None` waits indefinitely
    pub acquire_timeout_secs: Option<u64>,
    /// SSH port on every node
    pub ssh_port: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            username: "core".to_string(),
            key_path: PathBuf::from("~/.ssh/id_rsa"),
            master: None,
            leader: None,
            app_leader: None,
            noisy: true,
            poll_interval_ms: 100,
            read_chunk_size: 1024,
            acquire_timeout_secs: Some(60),
            ssh_port: SSH_PORT,
        }
    }
}

impl RunnerConfig {
    /// Defaults, overridden by the JSON file at `path` if given, then by
    /// `NODESHELL_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::layered(path, None)
    }

    /// Defaults overridden by `NODESHELL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(json, FileFormat::Json)))
    }

    /// Read a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from(path.as_ref()).format(FileFormat::Json)))
    }

    /// `env` stands in for the process environment when given
    fn layered(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Json));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true)
                .ignore_empty(true)
                .source(env),
        );
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Set the default username
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the default key path
    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = key_path.into();
        self
    }

    /// Set the control node address
    pub fn with_master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }

    /// Set the leader address
    pub fn with_leader(mut self, leader: impl Into<String>) -> Self {
        self.leader = Some(leader.into());
        self
    }

    /// Set the application leader address
    pub fn with_app_leader(mut self, app_leader: impl Into<String>) -> Self {
        self.app_leader = Some(app_leader.into());
        self
    }

    /// Enable or disable echo
    pub fn with_noisy(mut self, noisy: bool) -> Self {
        self.noisy = noisy;
        self
    }

    /// Set the drain poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Set the pool acquisition bound
    pub fn with_acquire_timeout(mut self, limit: Option<Duration>) -> Self {
        self.acquire_timeout_secs = limit.map(|d| d.as_secs().max(1));
        self
    }

    /// Set the SSH port
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Default key path with `~` and environment variables expanded
    pub fn expanded_key_path(&self) -> PathBuf {
        nodeshell_ssh::expand_key_path(&self.key_path)
    }

    /// Drain poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Session settings derived from this config
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_noisy(self.noisy)
            .with_poll_interval(self.poll_interval())
            .with_read_chunk_size(self.read_chunk_size)
    }

    /// Pool settings derived from this config
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default().with_acquire_timeout(self.acquire_timeout_secs.map(Duration::from_secs))
    }
}
