use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::observability::{TX_EXHAUSTED_TOTAL, TX_RETRIES_TOTAL};
use crate::store::{StorageError, Transaction};

use super::EngineError;

/// An attempt's finished transaction and the value to return once it commits.
pub type Staged<T> = (Box<dyn Transaction>, T);

/// Bounded exponential backoff around one transactional attempt.
///
/// Only errors accepted by the `retryable` predicate are re-run; everything
/// else is returned to the caller on the first attempt. An attempt that
/// outlives `attempt_timeout` counts as a transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    retryable: fn(&EngineError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
            multiplier: 2,
            max_delay: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(2),
            retryable: EngineError::is_transient,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            attempt_timeout,
            ..Self::default()
        }
    }

    /// Replace the retryable-error predicate.
    pub fn with_retryable(mut self, retryable: fn(&EngineError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Backoff before attempt `attempt + 1`. `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `attempt` until it succeeds, fails permanently, or the policy is
    /// exhausted. The closure receives the 1-based attempt number and must
    /// start a fresh transaction each time.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.run_attempts(op, move |n| self.bounded(attempt(n))).await
    }

    /// Like [`run`](Self::run) for writes: each attempt hands back its
    /// transaction together with the result, and the policy commits it.
    ///
    /// Only the work before the commit is bounded by `attempt_timeout`. A
    /// commit that has started runs to completion, so an attempt never
    /// times out after its writes became durable.
    pub async fn run_tx<T, F, Fut>(
        &self,
        op: &'static str,
        mut attempt: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Staged<T>, EngineError>>,
    {
        self.run_attempts(op, move |n| {
            let staged = self.bounded(attempt(n));
            async move {
                let (tx, value) = staged.await?;
                tx.commit().await?;
                Ok(value)
            }
        })
        .await
    }

    async fn bounded<T>(
        &self,
        attempt: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.attempt_timeout, attempt).await {
            Ok(r) => r,
            Err(_) => Err(EngineError::Transient(StorageError::Timeout(
                self.attempt_timeout,
            ))),
        }
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        op: &'static str,
        mut attempt: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut n = 0;
        loop {
            n += 1;
            match attempt(n).await {
                Err(e) if (self.retryable)(&e) => {
                    if n >= self.max_attempts {
                        metrics::counter!(TX_EXHAUSTED_TOTAL, "op" => op).increment(1);
                        error!(op, attempts = n, "retries exhausted: {e}");
                        return Err(EngineError::System {
                            attempts: n,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.delay_for_attempt(n);
                    metrics::counter!(TX_RETRIES_TOTAL, "op" => op).increment(1);
                    warn!(op, attempt = n, delay_ms = delay.as_millis() as u64, "retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
