//! Per-command sessions over pooled transports
//!
//! A [`RemoteSession`] owns one channel on a shared transport. It submits a
//! single command, drains the combined output until the remote side closes
//! the stream, and only then collects the exit status. The channel is released
//! on every exit path, including a dropped future; the transport is left to
//! the pool.

use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use nodeshell_ssh::{wait_ready, Channel, ConnectionPool, ReadState, SharedTransport, TransportError};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exit status reported when the remote side never sent one
pub const NO_EXIT_STATUS: i32 = -1;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Echo the command line and output to stdout as it arrives
    pub noisy: bool,
    /// Sleep between polls while output is not ready
    pub poll_interval: Duration,
    /// Upper bound on bytes taken per read
    pub read_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            noisy: true,
            poll_interval: Duration::from_millis(100),
            read_chunk_size: 1024,
        }
    }
}

impl SessionConfig {
    /// Enable or disable echo
    pub fn with_noisy(mut self, noisy: bool) -> Self {
        self.noisy = noisy;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the read chunk size; zero is treated as one
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }
}

/// Result of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Remote exit status, [`NO_EXIT_STATUS`] if none was reported
    pub exit_status: i32,
    /// Combined stdout/stderr bytes, in arrival order
    pub output: Bytes,
}

impl SessionOutcome {
    /// Outcome of a session that never ran its command
    pub fn not_run() -> Self {
        Self {
            exit_status: NO_EXIT_STATUS,
            output: Bytes::new(),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Output decoded as UTF-8, replacing invalid sequences
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// One command on one channel of a pooled transport
pub struct RemoteSession {
    id: Uuid,
    host: String,
    config: SessionConfig,
    transport: Option<SharedTransport>,
    channel: Option<Box<dyn Channel>>,
    submitted: bool,
    output: BytesMut,
}

impl RemoteSession {
    /// Acquire a transport for `username@host` from `pool` and open a
    /// channel on it.
    ///
    /// Never fails: if no transport can be obtained the reason is logged and
    /// the session becomes a no-op whose outcome reports failure. A pooled
    /// transport that passes validation but fails when a channel is opened
    /// is evicted and replaced once.
    pub async fn open(
        pool: &ConnectionPool,
        host: &str,
        username: &str,
        key_path: &Path,
        config: SessionConfig,
    ) -> Self {
        let mut session = Self::detached(host, config);

        let transport = match pool.get(host, username, key_path).await {
            Ok(transport) => transport,
            Err(e) => {
                report_acquire_failure(&session.id, host, &e);
                return session;
            }
        };

        match wait_ready(session.config.poll_interval, || transport.open_channel()).await {
            Ok(channel) => {
                session.channel = Some(channel);
                session.transport = Some(transport);
            }
            Err(e) if !e.is_stale() => {
                debug!(session = %session.id, "Channel to {} refused: {}", host, e);
                session.transport = Some(transport);
            }
            Err(e) => {
                warn!(session = %session.id, "Pooled transport to {} is unusable: {}", host, e);
                if let Err(e) = pool.evict(&transport).await {
                    debug!(session = %session.id, "Eviction for {} skipped: {}", host, e);
                }
                match pool.get(host, username, key_path).await {
                    Ok(fresh) => session.transport = Some(fresh),
                    Err(e) => report_acquire_failure(&session.id, host, &e),
                }
            }
        }

        session
    }

    /// Session on an already acquired transport
    pub fn with_transport(transport: SharedTransport, config: SessionConfig) -> Self {
        let mut session = Self::detached(&transport.info().host, config);
        session.transport = Some(transport);
        session
    }

    fn detached(host: &str, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.to_string(),
            config,
            transport: None,
            channel: None,
            submitted: false,
            output: BytesMut::new(),
        }
    }

    /// Session ID recorded in log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Target host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether a transport was acquired
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Submit `command`, opening a channel first if the session has none.
    /// Returns once the command is accepted; use [`finish`](Self::finish) to
    /// wait for it.
    pub async fn run(&mut self, command: &str) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::NotConnected(self.host.clone()))?;
        if self.submitted {
            return Err(Error::Session("a session runs exactly one command".to_string()));
        }
        self.submitted = true;

        if self.config.noisy {
            echo(format!("\n>> {} $ {}\n", self.host, command).as_bytes());
        }
        debug!(session = %self.id, "Running `{}` on {}", command, transport.info());

        let interval = self.config.poll_interval;
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => wait_ready(interval, || transport.open_channel()).await?,
        };
        let channel = self.channel.insert(channel);
        wait_ready(interval, || channel.exec(command)).await?;

        Ok(())
    }

    /// Drain all output, then close the channel and collect the exit status.
    ///
    /// Output read before a failure is kept; the exit status is then
    /// [`NO_EXIT_STATUS`].
    pub async fn finish(&mut self) -> SessionOutcome {
        let exit_status = match self.channel.as_mut() {
            Some(active) => match drain(active.as_mut(), &mut self.output, &self.config).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(session = %self.id, "Lost channel to {}: {}", self.host, e);
                    None
                }
            },
            None => None,
        };
        self.release();

        let outcome = SessionOutcome {
            exit_status: exit_status.unwrap_or(NO_EXIT_STATUS),
            output: self.output.split().freeze(),
        };
        debug!(
            session = %self.id,
            "Command on {} finished with status {} ({} bytes)",
            self.host,
            outcome.exit_status,
            outcome.output.len()
        );
        outcome
    }

    /// Run `command` to completion
    pub async fn execute(&mut self, command: &str) -> SessionOutcome {
        if let Err(e) = self.run(command).await {
            match e {
                Error::NotConnected(_) => {}
                other => warn!(session = %self.id, "Unable to run `{}` on {}: {}", command, self.host, other),
            }
        }
        self.finish().await
    }

    fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.channel.is_some() {
            debug!(session = %self.id, "Releasing unfinished channel to {}", self.host);
        }
        self.release();
    }
}

/// Read until the remote side closes, then wait for the exit status.
///
/// A `Pending` read only means nothing is ready yet; the loop sleeps and
/// polls again until `Closed`.
async fn drain(
    channel: &mut dyn Channel,
    output: &mut BytesMut,
    config: &SessionConfig,
) -> std::result::Result<Option<i32>, TransportError> {
    let mut buf = vec![0u8; config.read_chunk_size.max(1)];

    loop {
        match channel.read(&mut buf)? {
            ReadState::Data(n) => {
                let chunk = &buf[..n];
                if config.noisy {
                    echo(chunk);
                }
                output.extend_from_slice(chunk);
            }
            ReadState::Pending => tokio::time::sleep(config.poll_interval).await,
            ReadState::Closed => break,
        }
    }

    wait_ready(config.poll_interval, || channel.finish()).await
}

fn echo(bytes: &[u8]) {
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(bytes);
    let _ = stdout.flush();
}

fn report_acquire_failure(id: &Uuid, host: &str, err: &TransportError) {
    match err {
        TransportError::Authentication { .. } => warn!(session = %id, "{}", err),
        TransportError::Connection { .. } => warn!(session = %id, "host {} is unreachable: {}", host, err),
        _ => warn!(session = %id, "unable to open session on {}: {}", host, err),
    }
}
