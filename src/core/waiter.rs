//! Polling until remote state reaches a terminal condition.
//!
//! Every wait in the crate goes through [`Waiter::wait_until`]. The clock is
//! tokio's, so tests drive it with a paused runtime.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClientError, ClientErrorKind, ClientResult};
use crate::error::{Error, Failure, Result};

const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Consecutive throttling/server errors tolerated before giving up.
    pub max_transient_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl WaitConfig {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
            max_transient_retries: DEFAULT_MAX_TRANSIENT_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }

    pub fn with_retries(mut self, max: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_transient_retries = max;
        self.retry_base_delay = base_delay;
        self.retry_max_delay = max_delay;
        self
    }

    fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.retry_base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.retry_max_delay.as_millis().max(base_ms);
        let multiplier = 1u128 << retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

/// One poll result as seen by a predicate. "Not found" arrives as `Absent`.
#[derive(Debug)]
pub enum Observation<'a, S> {
    Present(&'a S),
    Absent,
}

#[derive(Debug)]
pub enum Verdict {
    /// Not terminal yet; carries the status for timeout reporting.
    Pending(String),
    Done,
    Failed(Error),
}

pub struct Waiter {
    config: WaitConfig,
    cancel: CancellationToken,
}

impl Waiter {
    pub fn new(config: WaitConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Sleep one interval, probe, ask the predicate; repeat until it is
    /// terminal or the timeout passes. Returns the final state, `None` if the
    /// resource was absent when the predicate accepted.
    pub async fn wait_until<S, F, Fut, P>(
        &self,
        resource: &str,
        mut probe: F,
        mut predicate: P,
    ) -> Result<Option<S>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<S>>,
        P: FnMut(Observation<'_, S>) -> Verdict,
    {
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            self.pause(self.config.poll_interval, resource).await?;
            polls += 1;

            let observed = match self.retrying(resource, ClientErrorKind::is_transient, &mut probe).await {
                Ok(state) => Some(state),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            let verdict = match &observed {
                Some(state) => predicate(Observation::Present(state)),
                None => predicate(Observation::Absent),
            };

            match verdict {
                Verdict::Done => {
                    debug!(resource, polls, elapsed_ms = started.elapsed().as_millis() as u64, "wait finished");
                    return Ok(observed);
                }
                Verdict::Failed(err) => return Err(err),
                Verdict::Pending(status) => {
                    debug!(resource, status = %status, polls, "still waiting");
                    let elapsed = started.elapsed();
                    if elapsed >= self.config.timeout {
                        warn!(resource, last_status = %status, "wait timed out");
                        return Err(Error::new(Failure::Timeout {
                            resource: resource.to_string(),
                            last_status: status,
                            elapsed,
                        }));
                    }
                }
            }
        }
    }

    /// Issue a read, retrying throttling and server errors with backoff.
    pub async fn read<T, F, Fut>(&self, resource: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut call = call;
        self.retrying(resource, ClientErrorKind::is_transient, &mut call).await
    }

    /// Issue a mutation, retrying only throttling. A server error on a
    /// mutation may mean the request was applied, so it is surfaced.
    pub async fn submit<T, F, Fut>(&self, resource: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut call = call;
        self.retrying(resource, |kind| kind == ClientErrorKind::Throttled, &mut call)
            .await
    }

    async fn retrying<T, F, Fut>(
        &self,
        resource: &str,
        retryable: fn(ClientErrorKind) -> bool,
        call: &mut F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(err.kind) => {
                    if attempts > self.config.max_transient_retries {
                        return Err(poll_error(resource, attempts, err));
                    }
                    let delay = self.config.backoff(attempts - 1);
                    warn!(
                        resource,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "transient remote error: {}",
                        err
                    );
                    self.pause(delay, resource).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn pause(&self, duration: Duration, resource: &str) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled(resource)),
            _ = sleep(duration) => Ok(()),
        }
    }
}

fn poll_error(resource: &str, attempts: u32, source: ClientError) -> Error {
    Error::new(Failure::Poll {
        resource: resource.to_string(),
        attempts,
        source,
    })
}
