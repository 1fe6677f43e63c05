//! Retry loop with failure classification and cleanup between attempts.

use super::config::{RetryConfig, RetryState};
use crate::errors::{ErrorClass, Result, TidemarkError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Classifies an error for retry decisions.
pub type Classifier = Arc<dyn Fn(&TidemarkError) -> ErrorClass + Send + Sync>;

/// A unit of work that is re-run as a whole on a retryable failure.
#[async_trait]
pub trait Attempt: Send {
    /// The value produced by a successful attempt.
    type Output: Send;

    /// Runs one attempt. `attempt` starts at 1.
    async fn run(&mut self, attempt: u32) -> Result<Self::Output>;

    /// Restores a clean state after a failed attempt, before the next one.
    async fn cleanup(&mut self, _error: &TidemarkError) -> Result<()> {
        Ok(())
    }
}

/// Drives an [`Attempt`] until it succeeds, fails fatally, or runs out of attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Option<Classifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Creates a policy classifying errors with [`TidemarkError::class`].
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: None,
        }
    }

    /// Overrides the error classifier.
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&TidemarkError) -> ErrorClass + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// The underlying config.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn classify(&self, err: &TidemarkError) -> ErrorClass {
        self.classifier
            .as_ref()
            .map_or_else(|| err.class(), |classify| classify(err))
    }

    /// Runs the attempt under this policy.
    ///
    /// Fatal errors are returned unchanged. Retryable errors run the
    /// attempt's cleanup, wait out the backoff delay and try again; once
    /// attempts are exhausted the last error is returned wrapped in
    /// [`TidemarkError::RetriesExhausted`]. A failing cleanup stops the loop
    /// and its error is returned.
    pub async fn execute<A: Attempt>(&self, attempt: &mut A) -> Result<A::Output> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut state = RetryState::new();
        let mut number = 1;

        loop {
            let err = match attempt.run(number).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            if self.classify(&err) == ErrorClass::Fatal {
                debug!(attempt = number, error = %err, "fatal error, not retrying");
                return Err(err);
            }

            if number >= max_attempts {
                warn!(attempts = number, error = %err, "retries exhausted");
                return Err(TidemarkError::RetriesExhausted {
                    attempts: number,
                    source: Box::new(err),
                });
            }

            if let Err(cleanup_err) = attempt.cleanup(&err).await {
                error!(
                    attempt = number,
                    error = %err,
                    cleanup_error = %cleanup_err,
                    "cleanup failed, abandoning retries"
                );
                return Err(cleanup_err);
            }

            let delay = state.next_delay(&self.config);
            warn!(
                attempt = number,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            number += 1;
        }
    }

    /// Runs a closure under this policy with no cleanup between attempts.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute(&mut FnAttempt(operation)).await
    }
}

struct FnAttempt<F>(F);

#[async_trait]
impl<T, F, Fut> Attempt for FnAttempt<F>
where
    T: Send + 'static,
    F: FnMut(u32) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    type Output = T;

    async fn run(&mut self, attempt: u32) -> Result<T> {
        (self.0)(attempt).await
    }
}
