//! libssh2 transport: direct connections, proxied connections and channels
//!
//! Sessions are connected and authenticated in blocking mode on the tokio
//! blocking pool, then switched to non-blocking mode before they are handed
//! out. In non-blocking mode libssh2 never parks a thread inside the session
//! lock, so any number of channels can be driven concurrently over one
//! transport.

use crate::transport::{Channel, ConnectionInfo, ReadState, TransportType, TunnelStream};
use crate::{wait_ready, Connector, Credential, SharedTransport, Transport, TransportError};
use async_trait::async_trait;
use ssh2::{ExtendedData, Session};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// libssh2 connection settings
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// TCP connect timeout for direct connections
    pub connect_timeout: Duration,
    /// Seconds between keepalive probes; 0 disables them
    pub keepalive_interval: u32,
    /// Idle sleep of the tunnel pump
    pub tunnel_poll_interval: Duration,
    /// Retry interval while opening forwarded channels
    pub open_poll_interval: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: 60,
            tunnel_poll_interval: Duration::from_millis(5),
            open_poll_interval: Duration::from_millis(10),
        }
    }
}

/// [`Connector`] backed by libssh2
#[derive(Debug, Clone, Default)]
pub struct Ssh2Connector {
    config: SshConfig,
}

impl Ssh2Connector {
    /// Create a connector with the given settings
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connector settings
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for Ssh2Connector {
    async fn connect(&self, host: &str, port: u16, username: &str) -> Result<SharedTransport, TransportError> {
        info!("Connecting to {}@{}:{}", username, host, port);

        let target = host.to_string();
        let connect_timeout = self.config.connect_timeout;
        let session = run_blocking(move || {
            let tcp = connect_tcp(&target, port, connect_timeout)?;
            handshake(tcp, &target, port)
        })
        .await?;

        let info = ConnectionInfo::direct(host, port, username, TransportType::SshLibssh2);
        Ok(Arc::new(SshTransport::new(info, session, None, &self.config)))
    }

    async fn tunnel(
        &self,
        jump: SharedTransport,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<SharedTransport, TransportError> {
        info!("Connecting to {}@{}:{} via {}", username, host, port, jump.info().host);

        let remote = wait_ready(self.config.open_poll_interval, || jump.open_tunnel(host, port))
            .await
            .map_err(|e| match e {
                TransportError::Channel(message) => TransportError::connection(host, port, message),
                other => other,
            })?;

        let label = format!("{}:{}", host, port);
        let (tunnel, local) = Tunnel::spawn(remote, &label, self.config.tunnel_poll_interval)?;

        let target = host.to_string();
        let session = run_blocking(move || handshake(local, &target, port)).await?;

        let info = ConnectionInfo::proxied(host, port, username, &jump.info().host, TransportType::SshLibssh2);
        Ok(Arc::new(SshTransport::new(info, session, Some(tunnel), &self.config)))
    }
}

/// A libssh2 session shared by every channel opened on it
pub struct SshTransport {
    info: ConnectionInfo,
    session: Session,
    tunnel: Option<Tunnel>,
    keepalive_interval: u32,
    broken: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl SshTransport {
    fn new(info: ConnectionInfo, session: Session, tunnel: Option<Tunnel>, config: &SshConfig) -> Self {
        Self {
            info,
            session,
            tunnel,
            keepalive_interval: config.keepalive_interval,
            broken: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed(self.info.host.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn authenticate(&self, username: &str, credential: &Credential) -> Result<(), TransportError> {
        self.ensure_open()?;
        debug!("Authenticating {} with key {}", self.info, credential.path().display());

        let session = self.session.clone();
        let username = username.to_string();
        let key = credential.private_key().to_string();
        let accepted = run_blocking(move || {
            session.set_blocking(true);
            if let Err(e) = session.userauth_pubkey_memory(&username, None, &key, None) {
                debug!("Public key rejected for {}: {}", username, e);
            }
            Ok(session.authenticated())
        })
        .await?;

        if accepted {
            if self.keepalive_interval > 0 {
                self.session.set_keepalive(true, self.keepalive_interval);
            }
            self.session.set_blocking(false);
        }

        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        !self.is_closed() && self.session.authenticated()
    }

    fn is_active(&self) -> bool {
        if self.is_closed() || self.broken.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(tunnel) = &self.tunnel {
            if !tunnel.is_running() {
                return false;
            }
        }
        if self.keepalive_interval == 0 {
            return true;
        }
        match self.session.keepalive_send() {
            Ok(_) => true,
            Err(e) => pending_or::<()>(&self.broken, e).is_ok(),
        }
    }

    fn open_channel(&self) -> Result<Poll<Box<dyn Channel>>, TransportError> {
        self.ensure_open()?;
        match self.session.channel_session() {
            Ok(channel) => Ok(Poll::Ready(Box::new(SshChannel::new(channel, Arc::clone(&self.broken))))),
            Err(e) => pending_or(&self.broken, e),
        }
    }

    fn open_tunnel(&self, host: &str, port: u16) -> Result<Poll<Box<dyn TunnelStream>>, TransportError> {
        self.ensure_open()?;
        match self.session.channel_direct_tcpip(host, port, Some(("127.0.0.1", 0))) {
            Ok(channel) => Ok(Poll::Ready(Box::new(channel))),
            Err(e) => pending_or(&self.broken, e),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing transport {}", self.info);
        if let Some(tunnel) = &self.tunnel {
            tunnel.stop();
        }
        if let Err(e) = self.session.disconnect(None, "closed by client", None) {
            debug!("Disconnect from {} incomplete: {}", self.info, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// One `exec` channel on a non-blocking session
pub struct SshChannel {
    channel: ssh2::Channel,
    broken: Arc<AtomicBool>,
    merged: bool,
    close_sent: bool,
}

impl SshChannel {
    fn new(channel: ssh2::Channel, broken: Arc<AtomicBool>) -> Self {
        Self {
            channel,
            broken,
            merged: false,
            close_sent: false,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        let signal = self.channel.exit_signal().ok().and_then(|s| s.exit_signal);
        if let Some(signal) = &signal {
            debug!("Remote command terminated by SIG{}", signal);
        }
        reported_status(self.channel.exit_status().ok(), signal.as_deref())
    }
}

impl Channel for SshChannel {
    fn exec(&mut self, command: &str) -> Result<Poll<()>, TransportError> {
        if !self.merged {
            match self.channel.handle_extended_data(ExtendedData::Merge) {
                Ok(()) => self.merged = true,
                Err(e) => return pending_or(&self.broken, e),
            }
        }
        match self.channel.exec(command) {
            Ok(()) => Ok(Poll::Ready(())),
            Err(e) => pending_or(&self.broken, e),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadState, TransportError> {
        // EOF has to be sampled before reading: data always precedes it on the
        // wire, so an empty read after EOF means the stream is exhausted.
        let eof = self.channel.eof();
        match self.channel.read(buf) {
            Ok(0) if eof => Ok(ReadState::Closed),
            Ok(0) => Ok(ReadState::Pending),
            Ok(n) => Ok(ReadState::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(if eof { ReadState::Closed } else { ReadState::Pending })
            }
            Err(e) => {
                self.broken.store(true, Ordering::SeqCst);
                Err(TransportError::Io(e))
            }
        }
    }

    fn finish(&mut self) -> Result<Poll<Option<i32>>, TransportError> {
        if !self.close_sent {
            match self.channel.close() {
                Ok(()) => self.close_sent = true,
                Err(e) => return pending_or(&self.broken, e),
            }
        }
        match self.channel.wait_close() {
            Ok(()) => Ok(Poll::Ready(self.exit_code())),
            Err(e) => pending_or(&self.broken, e),
        }
    }

    fn close(&mut self) {
        if !self.close_sent {
            self.close_sent = self.channel.close().is_ok();
        }
    }
}

impl TunnelStream for ssh2::Channel {
    fn is_eof(&self) -> bool {
        self.eof()
    }
}

/// Bridges a forwarded channel to a loopback socket so a second libssh2
/// session can run over it.
struct Tunnel {
    running: Arc<AtomicBool>,
    _pump: JoinHandle<()>,
}

impl Tunnel {
    /// Start the pump; returns the local end for the inner session
    fn spawn(remote: Box<dyn TunnelStream>, label: &str, idle: Duration) -> Result<(Self, TcpStream), TransportError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let local = TcpStream::connect(listener.local_addr()?)?;
        let (bridge, _) = listener.accept()?;
        bridge.set_nonblocking(true)?;
        bridge.set_nodelay(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let name = format!("tunnel {}", label);
        let pump = thread::Builder::new()
            .name(format!("nodeshell-tunnel-{}", label))
            .spawn(move || {
                pump(remote, bridge, &flag, idle);
                flag.store(false, Ordering::SeqCst);
                debug!("{} stopped", name);
            })?;

        Ok((Self { running, _pump: pump }, local))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Copy bytes both ways until either side closes or the tunnel is stopped.
fn pump(mut remote: Box<dyn TunnelStream>, mut local: TcpStream, running: &AtomicBool, idle: Duration) {
    let mut buf = vec![0u8; 32 * 1024];
    let mut downstream: Vec<u8> = Vec::new();
    let mut upstream: Vec<u8> = Vec::new();

    while running.load(Ordering::SeqCst) {
        let mut progressed = false;

        if downstream.is_empty() {
            let eof = remote.is_eof();
            match remote.read(&mut buf) {
                Ok(0) if eof => return,
                Ok(0) => {}
                Ok(n) => {
                    downstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if eof {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Tunnel read failed: {}", e);
                    return;
                }
            }
        }

        if !downstream.is_empty() {
            match local.write(&downstream) {
                Ok(0) => return,
                Ok(n) => {
                    downstream.drain(..n);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return,
            }
        }

        if upstream.is_empty() {
            match local.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    upstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return,
            }
        }

        if !upstream.is_empty() {
            match remote.write(&upstream) {
                Ok(n) => {
                    upstream.drain(..n);
                    progressed = n > 0 || progressed;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("Tunnel write failed: {}", e);
                    return;
                }
            }
        }

        if !progressed {
            thread::sleep(idle);
        }
    }
}

fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::connection(host, port, e.to_string()))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(TransportError::connection(
        host,
        port,
        last_error.map_or_else(|| "no addresses resolved".to_string(), |e| e.to_string()),
    ))
}

fn handshake(tcp: TcpStream, host: &str, port: u16) -> Result<Session, TransportError> {
    let mut session = Session::new().map_err(|e| TransportError::connection(host, port, e.message()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TransportError::connection(host, port, format!("handshake failed: {}", e)))?;
    Ok(session)
}

async fn run_blocking<T, F>(job: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| TransportError::Io(io::Error::other(e)))?
}

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

fn is_would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN)
}

/// Map a libssh2 failure. Anything worse than a refused channel marks the
/// whole session as broken so the pool stops handing it out.
fn pending_or<T>(broken: &AtomicBool, err: ssh2::Error) -> Result<Poll<T>, TransportError> {
    if is_would_block(&err) {
        return Ok(Poll::Pending);
    }
    let err = TransportError::from(err);
    if err.is_stale() && !broken.swap(true, Ordering::SeqCst) {
        warn!("libssh2 session failed: {}", err);
    }
    Err(err)
}

/// libssh2 reports status 0 when no `exit-status` message arrived, which is
/// what happens when the remote process dies from a signal.
fn reported_status(status: Option<i32>, signal: Option<&str>) -> Option<i32> {
    match signal {
        Some(_) => None,
        None => status,
    }
}
