//! Connection pool and management

use crate::{Credential, PoolKey, SharedTransport, Transport, TransportError, TransportFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on `get` and `purge`; `None` waits indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl PoolConfig {
    /// Set the acquisition bound
    pub fn with_acquire_timeout(mut self, limit: Option<Duration>) -> Self {
        self.acquire_timeout = limit;
        self
    }
}

/// Resolves the node every other node is reached through
#[async_trait]
pub trait ControlNode: Send + Sync {
    /// Address of the control node
    async fn address(&self) -> Result<String, TransportError>;
}

#[async_trait]
impl ControlNode for String {
    async fn address(&self) -> Result<String, TransportError> {
        Ok(self.clone())
    }
}

/// One cache entry. The lock is held for the whole check-create-insert
/// sequence, so at most one authentication per key is ever in flight.
type Slot = Arc<Mutex<Option<SharedTransport>>>;

/// Pool of authenticated transports, one per (host, username)
pub struct ConnectionPool {
    /// Pool configuration
    config: PoolConfig,
    /// Creates transports on a miss
    factory: TransportFactory,
    /// Jump host for everything that is not the control node
    control_node: Arc<dyn ControlNode>,
    /// Slots are created on first use and never removed
    slots: RwLock<HashMap<PoolKey, Slot>>,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(factory: TransportFactory, control_node: Arc<dyn ControlNode>, config: PoolConfig) -> Self {
        Self {
            config,
            factory,
            control_node,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a live, authenticated transport for `username@host`.
    ///
    /// The key at `key_path` is validated before anything else. A cached
    /// transport is reused when it is still active and authenticated, and is
    /// closed and replaced otherwise. Hosts other than the control node are
    /// reached through a pooled transport to the control node.
    pub async fn get(&self, host: &str, username: &str, key_path: &Path) -> Result<SharedTransport, TransportError> {
        let credential = Credential::load(key_path)?;
        self.get_with_credential(host, username, &credential).await
    }

    /// Same as [`get`](Self::get) with an already loaded key
    pub async fn get_with_credential(
        &self,
        host: &str,
        username: &str,
        credential: &Credential,
    ) -> Result<SharedTransport, TransportError> {
        self.bounded(self.acquire(host, username, credential)).await
    }

    async fn acquire(&self, host: &str, username: &str, credential: &Credential) -> Result<SharedTransport, TransportError> {
        let key = PoolKey::new(host, username);

        self.checkout(&key, || async move {
            let control = self.control_node.address().await?;
            if host == control {
                return self.factory.create(host, username, credential, None).await;
            }

            let jump_key = PoolKey::new(&control, username);
            let jump = self
                .checkout(&jump_key, || self.factory.create(&control, username, credential, None))
                .await?;

            self.factory.create(host, username, credential, Some(jump)).await
        })
        .await
    }

    /// Check the slot for `key` and fill it with `create` when it is empty or
    /// holds a dead transport.
    async fn checkout<F, Fut>(&self, key: &PoolKey, create: F) -> Result<SharedTransport, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedTransport, TransportError>>,
    {
        let slot = self.slot(key).await;
        let mut cached = slot.lock().await;

        if let Some(transport) = cached.as_ref() {
            if transport.is_active() && transport.is_authenticated() {
                debug!("Reusing pooled transport for {}", key);
                return Ok(Arc::clone(transport));
            }
        }

        if let Some(stale) = cached.take() {
            warn!("Evicting stale transport for {}", key);
            stale.close();
        }

        debug!("Creating new transport for {}", key);
        let transport = create().await?;
        *cached = Some(Arc::clone(&transport));

        info!("Pooled new transport for {}", key);
        Ok(transport)
    }

    async fn slot(&self, key: &PoolKey) -> Slot {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Close and drop the transport for `key`, or every transport when `key`
    /// is `None`. Returns how many transports were closed.
    pub async fn purge(&self, key: Option<&PoolKey>) -> Result<usize, TransportError> {
        self.bounded(self.purge_slots(key)).await
    }

    async fn purge_slots(&self, key: Option<&PoolKey>) -> Result<usize, TransportError> {
        let targets: Vec<(PoolKey, Slot)> = {
            let slots = self.slots.read().await;
            match key {
                Some(key) => slots
                    .get(key)
                    .map(|slot| vec![(key.clone(), Arc::clone(slot))])
                    .unwrap_or_default(),
                None => slots
                    .iter()
                    .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
                    .collect(),
            }
        };

        let mut closed = 0;
        for (key, slot) in targets {
            if let Some(transport) = slot.lock().await.take() {
                info!("Closing pooled transport for {}", key);
                transport.close();
                closed += 1;
            }
        }

        Ok(closed)
    }

    /// Close and drop `transport` if it is still the pooled one for its key.
    ///
    /// For transports that passed validation but turned out to be unusable.
    /// Returns false when the slot already holds something else.
    pub async fn evict(&self, transport: &SharedTransport) -> Result<bool, TransportError> {
        self.bounded(self.evict_slot(transport)).await
    }

    async fn evict_slot(&self, transport: &SharedTransport) -> Result<bool, TransportError> {
        let key = transport.info().pool_key();
        let Some(slot) = self.slots.read().await.get(&key).cloned() else {
            return Ok(false);
        };

        let mut cached = slot.lock().await;
        if !cached.as_ref().is_some_and(|current| Arc::ptr_eq(current, transport)) {
            return Ok(false);
        }
        if let Some(stale) = cached.take() {
            warn!("Evicting unusable transport for {}", key);
            stale.close();
        }
        Ok(true)
    }

    /// Close every pooled transport
    pub async fn shutdown(&self) -> Result<usize, TransportError> {
        info!("Shutting down connection pool");
        self.purge(None).await
    }

    /// Cached transport for `key`, without validating it
    pub async fn cached(&self, key: &PoolKey) -> Option<SharedTransport> {
        let slot = self.slots.read().await.get(key).cloned()?;
        let cached = slot.lock().await;
        cached.clone()
    }

    /// Whether a transport is cached for `key`
    pub async fn contains(&self, key: &PoolKey) -> bool {
        self.cached(key).await.is_some()
    }

    /// Number of cached transports
    pub async fn len(&self) -> usize {
        self.stats().await.entries
    }

    /// Whether the pool holds no transports
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get pool statistics.
    ///
    /// Slots busy with an authentication attempt are counted as in flight
    /// rather than waited on.
    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.read().await;
        let mut stats = PoolStats::default();

        for slot in slots.values() {
            let Ok(cached) = slot.try_lock() else {
                stats.in_flight += 1;
                continue;
            };
            if let Some(transport) = cached.as_ref() {
                stats.entries += 1;
                if transport.info().is_proxied() {
                    stats.proxied += 1;
                }
                if !transport.is_closed() && transport.is_authenticated() {
                    stats.authenticated += 1;
                }
            }
        }

        stats
    }

    async fn bounded<T, Fut>(&self, op: Fut) -> Result<T, TransportError>
    where
        Fut: Future<Output = Result<T, TransportError>>,
    {
        match self.config.acquire_timeout {
            Some(limit) => timeout(limit, op).await.map_err(|_| TransportError::Timeout(limit))?,
            None => op.await,
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            if let Ok(mut cached) = slot.try_lock() {
                if let Some(transport) = cached.take() {
                    transport.close();
                }
            }
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of cached transports
    pub entries: usize,
    /// Cached transports that are open and authenticated
    pub authenticated: usize,
    /// Cached transports tunnelled through the control node
    pub proxied: usize,
    /// Keys with a connection attempt in progress
    pub in_flight: usize,
}

#[cfg(test)]
mod tests;
