//! A staging backend that fails or stalls a chosen promotion.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Result, TidemarkError};
use crate::staging::StagingBackend;

/// Wraps a backend and fails the `n`-th promotion (rename or copy), once.
///
/// Built with [`FailingStagingBackend::stalling`] it instead lets the
/// `n`-th promotion land and then hangs before reporting back, like a
/// rename whose completion is never observed by the caller.
#[derive(Debug)]
pub struct FailingStagingBackend<B> {
    inner: Arc<B>,
    fail_at: usize,
    stall: Option<Duration>,
    promotions: AtomicUsize,
}

impl<B: StagingBackend> FailingStagingBackend<B> {
    /// Fails promotion number `fail_at` (1-based).
    #[must_use]
    pub fn new(inner: Arc<B>, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            stall: None,
            promotions: AtomicUsize::new(0),
        }
    }

    /// Completes promotion number `stall_at` (1-based), then sleeps for
    /// `stall` before returning.
    #[must_use]
    pub fn stalling(inner: Arc<B>, stall_at: usize, stall: Duration) -> Self {
        Self {
            inner,
            fail_at: stall_at,
            stall: Some(stall),
            promotions: AtomicUsize::new(0),
        }
    }

    /// Promotions attempted so far, including the failed one.
    #[must_use]
    pub fn promotions(&self) -> usize {
        self.promotions.load(Ordering::SeqCst)
    }

    /// Counts a promotion; returns the stall to apply after it, if any.
    fn check_promotion(&self, from: &str) -> Result<Option<Duration>> {
        let n = self.promotions.fetch_add(1, Ordering::SeqCst) + 1;
        if n != self.fail_at {
            return Ok(None);
        }
        match self.stall {
            Some(stall) => Ok(Some(stall)),
            None => Err(TidemarkError::transient(format!(
                "injected promotion failure for '{from}'"
            ))),
        }
    }

    async fn after_promotion(stall: Option<Duration>) {
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
    }
}

#[async_trait]
impl<B: StagingBackend> StagingBackend for FailingStagingBackend<B> {
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.inner.write(key, bytes).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.read(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    fn supports_rename(&self) -> bool {
        self.inner.supports_rename()
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let stall = self.check_promotion(from)?;
        self.inner.rename(from, to).await?;
        Self::after_promotion(stall).await;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let stall = self.check_promotion(from)?;
        self.inner.copy(from, to).await?;
        Self::after_promotion(stall).await;
        Ok(())
    }

    async fn checksum(&self, key: &str) -> Result<String> {
        self.inner.checksum(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        self.inner.clear_prefix(prefix).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}
