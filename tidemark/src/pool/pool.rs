//! Bounded pool of credentialed connections.

use super::credential::{Connector, Credential, CredentialProvider};
use crate::errors::{Result, TidemarkError};
use crate::utils::{now_utc, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections.
    pub max_size: usize,
    /// How long `acquire` and each connect/refresh call may take, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Credentials expiring within this window are refreshed before hand-out.
    pub refresh_buffer_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout_ms: 30_000,
            refresh_buffer_ms: 60_000,
        }
    }
}

impl PoolConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum size.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, timeout: u64) -> Self {
        self.acquire_timeout_ms = timeout;
        self
    }

    /// Sets the refresh buffer.
    #[must_use]
    pub fn with_refresh_buffer_ms(mut self, buffer: u64) -> Self {
        self.refresh_buffer_ms = buffer;
        self
    }

    /// Rejects an empty pool or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(TidemarkError::configuration("pool.max_size must be at least 1"));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(TidemarkError::configuration(
                "pool.acquire_timeout_ms must be positive",
            ));
        }
        Ok(())
    }

    fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    fn refresh_buffer(&self) -> Duration {
        Duration::from_millis(self.refresh_buffer_ms)
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured maximum.
    pub max_size: usize,
    /// Open connections, idle or in use.
    pub live: usize,
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections held by callers.
    pub in_use: usize,
    /// Connections opened since start.
    pub created: u64,
    /// Connections discarded since start.
    pub discarded: u64,
    /// In-place credential refreshes since start.
    pub refreshed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    InUse,
}

struct PooledConnection<T> {
    id: u64,
    handle: T,
    credential: Credential,
    created_at: Timestamp,
}

struct PoolInner<C: Connector> {
    connector: C,
    credentials: Arc<dyn CredentialProvider>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection<C::Connection>>>,
    registry: DashMap<u64, SlotState>,
    next_id: AtomicU64,
    closed: AtomicBool,
    created: AtomicU64,
    discarded: AtomicU64,
    refreshed: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.config.acquire_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| {
                TidemarkError::connection(format!(
                    "{operation} timed out after {}ms",
                    limit.as_millis()
                ))
            })?
    }

    async fn open(&self) -> Result<PooledConnection<C::Connection>> {
        let credential = self
            .with_timeout("credential fetch", self.credentials.get_token())
            .await?;
        let params = self
            .with_timeout("parameter fetch", self.credentials.get_connection_params())
            .await?;
        let handle = self
            .with_timeout("connect", self.connector.connect(&params, &credential))
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.insert(id, SlotState::InUse);
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = id, "pooled connection opened");

        Ok(PooledConnection {
            id,
            handle,
            credential,
            created_at: now_utc(),
        })
    }

    /// Removes a connection from the registry and closes it.
    async fn destroy(&self, conn: PooledConnection<C::Connection>) {
        self.registry.remove(&conn.id);
        if let Err(e) = self.connector.close(conn.handle).await {
            warn!(connection_id = conn.id, error = %e, "closing pooled connection failed");
        }
    }

    fn guard(
        self: &Arc<Self>,
        conn: PooledConnection<C::Connection>,
        permit: OwnedSemaphorePermit,
    ) -> PoolGuard<C> {
        PoolGuard {
            lease: Lease {
                pool: Arc::clone(self),
                id: conn.id,
                _permit: permit,
                armed: true,
            },
            conn,
        }
    }
}

/// A bounded, reusable pool of connections to one backend.
///
/// At most `max_size` connections are ever open. Callers beyond that wait
/// in FIFO order until a holder releases or discards its connection.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates an empty pool. Connections are opened on demand.
    pub fn new(
        connector: C,
        credentials: Arc<dyn CredentialProvider>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                credentials,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                config,
                idle: Mutex::new(VecDeque::new()),
                registry: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                refreshed: AtomicU64::new(0),
            }),
        })
    }

    /// The pool config.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns true once `close_all` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Takes a connection, waiting if all `max_size` are in use.
    ///
    /// Fails with a retryable [`TidemarkError::Connection`] when no slot
    /// frees up within the acquire timeout, and with a connection error
    /// after `close_all`.
    pub async fn acquire(&self) -> Result<PoolGuard<C>> {
        if self.is_closed() {
            return Err(TidemarkError::connection("connection pool is closed"));
        }

        let limit = self.inner.config.acquire_timeout();
        let permit = tokio::time::timeout(limit, self.inner.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| {
                TidemarkError::connection(format!(
                    "no pooled connection available after {}ms",
                    limit.as_millis()
                ))
            })?
            .map_err(|_| TidemarkError::connection("connection pool is closed"))?;

        // the guard owns an idle connection before any await, so a cancelled
        // acquire discards it instead of leaking its registry entry
        let idle = self.inner.idle.lock().pop_front();
        match idle {
            Some(conn) => {
                self.inner.registry.insert(conn.id, SlotState::InUse);
                self.inner.guard(conn, permit).make_fresh().await
            }
            None => {
                let conn = self.inner.open().await?;
                Ok(self.inner.guard(conn, permit))
            }
        }
    }

    /// Closes idle connections and refuses further acquires.
    ///
    /// Connections currently held are closed when their holder releases them.
    pub async fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();

        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.inner.destroy(conn).await;
        }
        info!(closed = count, "connection pool closed");
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut idle = 0;
        let mut in_use = 0;
        for slot in &self.inner.registry {
            match *slot.value() {
                SlotState::Idle => idle += 1,
                SlotState::InUse => in_use += 1,
            }
        }
        PoolStats {
            max_size: self.inner.config.max_size,
            live: idle + in_use,
            idle,
            in_use,
            created: self.inner.created.load(Ordering::SeqCst),
            discarded: self.inner.discarded.load(Ordering::SeqCst),
            refreshed: self.inner.refreshed.load(Ordering::SeqCst),
        }
    }
}

/// Registry slot and semaphore permit of a handed-out connection.
///
/// Dropping an armed lease counts as a discard: the registry entry is
/// removed and the permit frees the slot.
struct Lease<C: Connector> {
    pool: Arc<PoolInner<C>>,
    id: u64,
    _permit: OwnedSemaphorePermit,
    armed: bool,
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            connection_id = self.id,
            "pooled connection dropped without release, discarding"
        );
        self.pool.registry.remove(&self.id);
        self.pool.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// Exclusive access to a pooled connection.
///
/// Give it back with [`PoolGuard::release`], or [`PoolGuard::discard`] it
/// after an I/O error. A guard dropped without either is discarded and its
/// handle dropped unclosed.
pub struct PoolGuard<C: Connector> {
    conn: PooledConnection<C::Connection>,
    lease: Lease<C>,
}

impl<C: Connector> PoolGuard<C> {
    /// Registry id of the connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.id
    }

    /// The credential the connection currently uses.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.conn.credential
    }

    /// When the connection was opened.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.conn.created_at
    }

    /// Refreshes a credential within the refresh buffer of expiry.
    ///
    /// Tries in place first; if that fails the connection is closed and a
    /// new one opened under the same permit.
    async fn make_fresh(mut self) -> Result<Self> {
        let pool = Arc::clone(&self.lease.pool);
        if !self.conn.credential.expires_within(pool.config.refresh_buffer()) {
            return Ok(self);
        }

        let credential = match pool
            .with_timeout("credential refresh", pool.credentials.get_token())
            .await
        {
            Ok(credential) => credential,
            Err(e) => {
                self.discard().await;
                return Err(e);
            }
        };

        let refreshed = pool
            .with_timeout(
                "connection refresh",
                pool.connector.refresh(&mut self.conn.handle, &credential),
            )
            .await;

        match refreshed {
            Ok(()) => {
                self.conn.credential = credential;
                pool.refreshed.fetch_add(1, Ordering::SeqCst);
                debug!(connection_id = self.conn.id, "pooled connection credential refreshed");
                Ok(self)
            }
            Err(e) => {
                warn!(
                    connection_id = self.conn.id,
                    error = %e,
                    "in-place refresh failed, recreating connection"
                );
                let PoolGuard { conn, mut lease } = self;
                lease.armed = false;
                pool.discarded.fetch_add(1, Ordering::SeqCst);
                pool.destroy(conn).await;

                let fresh = pool.open().await?;
                lease.id = fresh.id;
                lease.armed = true;
                Ok(PoolGuard { conn: fresh, lease })
            }
        }
    }

    /// Returns the connection to the idle set. Never closes it, unless the
    /// pool was closed meanwhile.
    pub async fn release(self) {
        let PoolGuard { conn, mut lease } = self;
        lease.armed = false;
        let pool = Arc::clone(&lease.pool);

        if pool.closed.load(Ordering::SeqCst) {
            pool.destroy(conn).await;
        } else {
            // back in the idle set before the permit frees a waiter
            pool.registry.insert(conn.id, SlotState::Idle);
            pool.idle.lock().push_back(conn);
        }
        drop(lease);
    }

    /// Closes the connection and frees its slot.
    pub async fn discard(self) {
        let PoolGuard { conn, mut lease } = self;
        lease.armed = false;
        let pool = Arc::clone(&lease.pool);

        pool.discarded.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = conn.id, "pooled connection discarded");
        pool.destroy(conn).await;
        drop(lease);
    }
}

impl<C: Connector> std::fmt::Debug for PoolGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("connection_id", &self.conn.id)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PoolGuard<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn.handle
    }
}

impl<C: Connector> DerefMut for PoolGuard<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.handle
    }
}
