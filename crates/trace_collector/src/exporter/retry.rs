//! Retry with exponential backoff around a [`TraceRepository`].

use async_trait::async_trait;
use pipeline_core::confmap::duration;
use pipeline_core::{Validate, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::repository::{InsertSpansParam, RepositoryError, TraceRepository};

/// Backoff schedule for repository inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first insert; 0 disables retrying
    pub max_retries: u32,
    /// Pause before the first retry
    #[serde(with = "duration")]
    pub initial_delay: Duration,
    /// Ceiling for any single pause
    #[serde(with = "duration")]
    pub max_delay: Duration,
    /// Growth factor between consecutive pauses
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Pause before insert `attempt`, where attempt 0 is the first try and never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        // a huge exponent saturates to infinity
        if !delay_ms.is_finite() {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.ensure(
            self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0,
            "backoffMultiplier must be at least 1.0",
        );
        errors.ensure(
            self.initial_delay <= self.max_delay,
            "initialDelay must not exceed maxDelay",
        );
        errors.into_result()
    }
}

/// Re-runs inserts that failed with a retryable error, pausing per [`RetryConfig`].
pub struct RetryingRepository {
    inner: Arc<dyn TraceRepository>,
    config: RetryConfig,
    /// Retries issued across all inserts
    total_retries: AtomicU64,
    /// Inserts that landed on a retry
    recovered_inserts: AtomicU64,
}

impl RetryingRepository {
    pub fn new(inner: Arc<dyn TraceRepository>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_inserts: AtomicU64::new(0),
        }
    }

    /// Wraps `inner` with [`RetryConfig::default`].
    pub fn with_defaults(inner: Arc<dyn TraceRepository>) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    /// Retries issued so far.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Inserts that failed at first and then succeeded.
    pub fn recovered_inserts(&self) -> u64 {
        self.recovered_inserts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TraceRepository for RetryingRepository {
    async fn insert_spans(&self, param: &InsertSpansParam) -> Result<(), RepositoryError> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut last = None;

        for attempt in 0..max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            if !delay.is_zero() {
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                sleep(delay).await;
            }

            match self.inner.insert_spans(param).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_inserts.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        repository = %self.inner.name(),
                        tenant = %param.tenant,
                        ttl = %param.ttl,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "insert failed"
                    );
                    last = Some(e);
                }
            }
        }

        Err(RepositoryError::RetriesExhausted {
            attempts: max_attempts,
            last: Box::new(last.unwrap_or_else(|| RepositoryError::Transport("no attempt made".to_string()))),
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
