//! Shared request budget
//!
//! A single token bucket throttles every outbound request, page fetches and
//! media downloads alike. Tokens are permits on a semaphore; a background task
//! deposits one permit every `1 / rate` seconds and discards it when the
//! bucket already holds `BURST_FACTOR × rate` permits.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Bucket capacity in seconds worth of tokens
pub const BURST_FACTOR: usize = 10;

/// Returned by [`RateLimiter::acquire`] once the limiter has been shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limiter is shut down")]
pub struct LimiterClosed;

/// Result of waiting for a token while a stop signal may fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Stopped,
}

/// Token bucket shared by all crawl tasks and download workers
#[derive(Debug)]
pub struct RateLimiter {
    tokens: Semaphore,
    capacity: usize,
    period: Duration,
}

impl RateLimiter {
    /// Creates an empty bucket for `rate` requests per second
    pub fn new(rate: u32) -> Self {
        let rate = rate.max(1);
        Self {
            tokens: Semaphore::new(0),
            capacity: rate as usize * BURST_FACTOR,
            period: Duration::from_secs_f64(1.0 / f64::from(rate)),
        }
    }

    /// Waits for a token and consumes it
    pub async fn acquire(&self) -> Result<(), LimiterClosed> {
        let permit = self.tokens.acquire().await.map_err(|_| LimiterClosed)?;
        permit.forget();
        Ok(())
    }

    /// Waits for a token unless `stop` fires first
    ///
    /// When both are ready the stop signal wins. A closed limiter counts as
    /// stopped.
    pub async fn acquire_or_stop(&self, stop: &CancellationToken) -> Admission {
        tokio::select! {
            biased;
            _ = stop.cancelled() => Admission::Stopped,
            result = self.acquire() => match result {
                Ok(()) => Admission::Granted,
                Err(LimiterClosed) => Admission::Stopped,
            },
        }
    }

    /// Tokens currently in the bucket
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails every pending and future `acquire`
    pub fn close(&self) {
        self.tokens.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tokens.is_closed()
    }

    /// Deposits tokens until `cancel` fires, then closes the bucket
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.tokens.available_permits() < self.capacity {
                        self.tokens.add_permits(1);
                    }
                }
            }
        }

        tracing::debug!("Rate limiter stopped");
        self.close();
    }

    /// Spawns [`run`](Self::run) on the runtime
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move { limiter.run(cancel).await })
    }
}
