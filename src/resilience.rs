// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry with backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: exponential backoff for transient registry failures
//! - [`RateLimiter`]: token bucket throttling registry API calls
//! - [`Bulkhead`]: semaphore bounding concurrent task execution in a tick
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), registry_mirror::resilience::BulkheadFull> {
//! use registry_mirror::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! // At most 20 registry calls per second, bursts of 5
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 5, refill_rate: 20 });
//! limiter.acquire().await;
//!
//! // Two tasks at a time
//! let bulkhead = Bulkhead::new(2);
//! let _permit = bulkhead.acquire().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Retry behavior for transient registry failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 doubles the delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual HTTP request.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(2),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::testing()
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);

        std::cmp::min(delay, self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is exhausted.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket parameters.
///
/// Tokens refill at `refill_rate` per second up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 10 requests/sec with a burst of 10, friendly to public registries.
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 10,
        }
    }
}

/// Token bucket rate limiter for registry API calls.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when the bulkhead has been closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

impl From<BulkheadFull> for SyncError {
    fn from(e: BulkheadFull) -> Self {
        SyncError::Internal(e.to_string())
    }
}

/// Limits how many tasks of one tick execute at the same time.
///
/// A limit of 1 gives strictly sequential execution in acquisition order.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead; a limit of 0 is raised to 1.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary. The slot is released on drop.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}
