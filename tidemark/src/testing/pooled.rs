//! A Home that reads through a [`ConnectionPool`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::mocks::MemoryHome;
use crate::batch::Schema;
use crate::errors::{Result, TidemarkError};
use crate::flow::{BatchStream, Home, LowerBound};
use crate::pool::{ConnectionPool, Connector, Credential, CredentialProvider, PoolConfig};
use crate::utils::now_utc;

/// An open session against the in-memory source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySession {
    /// Session number, starting at 1.
    pub number: u64,
    /// Token the session was opened or last refreshed with.
    pub token: String,
}

/// Opens numbered sessions; counts closes.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    opened: AtomicU64,
    closed: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Creates a connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared close counter, readable after the connector moved into a pool.
    #[must_use]
    pub fn closed(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.closed)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemorySession;

    async fn connect(
        &self,
        _params: &HashMap<String, String>,
        credential: &Credential,
    ) -> Result<MemorySession> {
        Ok(MemorySession {
            number: self.opened.fetch_add(1, Ordering::SeqCst) + 1,
            token: credential.token.clone(),
        })
    }

    async fn refresh(&self, connection: &mut MemorySession, credential: &Credential) -> Result<()> {
        connection.token.clone_from(&credential.token);
        Ok(())
    }

    async fn close(&self, _connection: MemorySession) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Issues hour-long tokens.
#[derive(Debug, Default)]
pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self) -> Result<Credential> {
        Ok(Credential::new(
            "memory-token",
            now_utc() + chrono::Duration::hours(1),
        ))
    }

    async fn get_connection_params(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([("source".to_string(), "memory".to_string())]))
    }
}

/// A [`MemoryHome`] whose every call holds a pooled connection.
///
/// Connections are released after a successful call. A scripted read
/// failure behaves like a dropped connection: the connection is discarded
/// and the read fails with a retryable error.
#[derive(Debug)]
pub struct PooledHome {
    inner: MemoryHome,
    pool: ConnectionPool<MemoryConnector>,
    read_failures: Mutex<u32>,
    read_connections: Arc<Mutex<Vec<u64>>>,
}

impl PooledHome {
    /// Serves `inner` through a pool of `max_size` connections.
    pub fn new(inner: MemoryHome, max_size: usize) -> Result<Self> {
        let pool = ConnectionPool::new(
            MemoryConnector::new(),
            Arc::new(StaticCredentials),
            PoolConfig::new()
                .with_max_size(max_size)
                .with_acquire_timeout_ms(1_000),
        )?;
        Ok(Self {
            inner,
            pool,
            read_failures: Mutex::new(0),
            read_connections: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Fails the next `times` reads as if the connection broke.
    #[must_use]
    pub fn fail_reads(self, times: u32) -> Self {
        *self.read_failures.lock() = times;
        self
    }

    /// A handle onto the pool.
    #[must_use]
    pub fn pool(&self) -> ConnectionPool<MemoryConnector> {
        self.pool.clone()
    }

    /// Pool id of the connection each `read_batches` call used.
    #[must_use]
    pub fn read_connections(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.read_connections)
    }

    fn take_failure(&self) -> bool {
        let mut remaining = self.read_failures.lock();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

#[async_trait]
impl Home for PooledHome {
    async fn get_schema(&self) -> Result<Schema> {
        let conn = self.pool.acquire().await?;
        match self.inner.get_schema().await {
            Ok(schema) => {
                conn.release().await;
                Ok(schema)
            }
            Err(e) => {
                conn.discard().await;
                Err(e)
            }
        }
    }

    async fn read_batches(&self, lower_bound: Option<LowerBound>) -> Result<BatchStream> {
        let conn = self.pool.acquire().await?;
        self.read_connections.lock().push(conn.id());

        if self.take_failure() {
            let id = conn.id();
            conn.discard().await;
            return Err(TidemarkError::transient(format!(
                "connection {id} reset during read"
            )));
        }

        match self.inner.read_batches(lower_bound).await {
            Ok(stream) => {
                conn.release().await;
                Ok(stream)
            }
            Err(e) => {
                conn.discard().await;
                Err(e)
            }
        }
    }
}
