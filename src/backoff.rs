use std::{ops::ControlFlow, time::Duration};

use rand::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

/// Exponential backoff with decorrelated jitter algorithm
///
/// The first backoff will always be `init_backoff`.
///
/// Subsequent backoffs will pick a random value between `init_backoff` and
/// `base * <previous backoff>` and then clamp it to `max_backoff`.
///
/// Based on <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,

    /// Give up after this many failed attempts, `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            base: 3.,
            max_retries: Some(10),
        }
    }
}

impl BackoffConfig {
    /// Always wait `backoff`, at most `max_retries` times.
    pub fn fixed(backoff: Duration, max_retries: usize) -> Self {
        Self {
            init_backoff: backoff,
            max_backoff: backoff,
            base: 1.,
            max_retries: Some(max_retries),
        }
    }
}

type SourceError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackoffError {
    #[error("Retry limit of {retries} exceeded: {source}")]
    RetryLimit { retries: usize, source: SourceError },
}

pub type BackoffResult<T> = Result<T, BackoffError>;

/// Error (which should increase backoff) or throttle for a specific duration (as asked for by the broker).
#[derive(Debug)]
pub enum ErrorOrThrottle<E> {
    Error(E),
    Throttle(Duration),
}

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff interval
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    max_retries: Option<usize>,
    retries: usize,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("max_retries", &self.max_retries)
            .field("retries", &self.retries)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`
    ///
    /// Used [`rand::thread_rng()`] if no rng provided
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            max_retries: config.max_retries,
            retries: 0,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for
    fn next(&mut self) -> Duration {
        let upper = self.next_backoff_secs * self.base;
        let rand_backoff = if upper > self.init_backoff {
            let range = self.init_backoff..upper;
            match self.rng.as_mut() {
                None => thread_rng().gen_range(range),
                Some(rng) => rng.gen_range(range),
            }
        } else {
            self.init_backoff
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform an async operation that retries with a backoff
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        request_name: &str,
        do_stuff: F,
    ) -> BackoffResult<B>
    where
        F: (Fn() -> F1) + Send + Sync,
        F1: std::future::Future<Output = ControlFlow<B, ErrorOrThrottle<E>>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            let e = match do_stuff().await {
                ControlFlow::Break(r) => break Ok(r),
                ControlFlow::Continue(ErrorOrThrottle::Error(e)) => e,
                ControlFlow::Continue(ErrorOrThrottle::Throttle(throttle)) => {
                    info!(
                        ?throttle,
                        request_name, "broker asked us to throttle, sleeping",
                    );
                    tokio::time::sleep(throttle).await;
                    continue;
                }
            };

            self.retries += 1;
            if let Some(max_retries) = self.max_retries {
                if self.retries > max_retries {
                    warn!(
                        e=%e,
                        request_name,
                        retries = max_retries,
                        "request failed, giving up",
                    );
                    return Err(BackoffError::RetryLimit {
                        retries: max_retries,
                        source: Box::new(e),
                    });
                }
            }

            let backoff = self.next();
            info!(
                e=%e,
                request_name,
                backoff_ms = backoff.as_millis() as u64,
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
