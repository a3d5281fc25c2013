//! Deadline-bounded condition polling
//!
//! `eventually` re-runs a probe at a fixed interval until it reports
//! [`Probe::Ready`], reports [`Probe::Failed`], or the deadline elapses.
//! Probes report query errors as [`Probe::Pending`] so a transient API
//! failure is retried instead of ending the wait.
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::eventually::{eventually, Probe};
//! use std::time::Duration;
//!
//! let pods = eventually("pod/tshare1", || async {
//!     match locator.pods(&selector).await {
//!         Ok(pods) if !pods.is_empty() => Probe::Ready(pods),
//!         Ok(_) => Probe::Pending("no pods match".to_string()),
//!         Err(e) => Probe::Pending(format!("query failed: {e}")),
//!     }
//! })
//! .timeout(Duration::from_secs(10))
//! .await_condition()
//! .await?;
//! ```

use crate::wait::WaitError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

/// Default polling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One observation of live state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// The condition holds
    Ready(T),
    /// Not yet; carries a description of what was observed
    Pending(String),
    /// The condition can never hold; stop waiting
    Failed(String),
}

/// Error type for condition waits
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("wait for {0} needs a timeout greater than zero")]
    ZeroTimeout(String),

    #[error("{0}")]
    Timeout(#[from] WaitError),

    #[error("{resource} can no longer satisfy the condition: {reason}")]
    Failed { resource: String, reason: String },
}

impl ConditionError {
    /// The timeout detail, if this was a timeout
    pub fn as_timeout(&self) -> Option<&WaitError> {
        match self {
            Self::Timeout(err) => Some(err),
            _ => None,
        }
    }
}

/// Builder for a deadline-bounded wait
pub struct Eventually<F> {
    resource: String,
    probe: F,
    timeout: Duration,
    interval: Duration,
}

/// Create a wait on `resource` that retries `probe` until it is ready
///
/// Default timeout: 60 seconds
/// Default interval: 1 second
pub fn eventually<F, Fut, T>(resource: impl Into<String>, probe: F) -> Eventually<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T>>,
{
    Eventually {
        resource: resource.into(),
        probe,
        timeout: DEFAULT_TIMEOUT,
        interval: DEFAULT_INTERVAL,
    }
}

impl<F, Fut, T> Eventually<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T>>,
{
    /// Set the deadline, measured from the start of `await_condition`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the polling interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the probe until it is ready, fails, or the deadline passes
    ///
    /// A probe still in flight at the deadline is abandoned; no attempt
    /// starts after the deadline.
    pub async fn await_condition(mut self) -> Result<T, ConditionError> {
        if self.timeout.is_zero() {
            return Err(ConditionError::ZeroTimeout(self.resource));
        }

        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;
        let mut last_state = "not observed yet".to_string();

        loop {
            attempts += 1;

            match timeout_at(deadline, (self.probe)()).await {
                Ok(Probe::Ready(value)) => {
                    debug!(
                        resource = %self.resource,
                        attempts = attempts,
                        elapsed = ?start.elapsed(),
                        "Condition met"
                    );
                    return Ok(value);
                }
                Ok(Probe::Failed(reason)) => {
                    return Err(ConditionError::Failed {
                        resource: self.resource,
                        reason,
                    });
                }
                Ok(Probe::Pending(state)) => {
                    debug!(
                        resource = %self.resource,
                        state = %state,
                        elapsed = ?start.elapsed(),
                        "Condition not met yet, waiting..."
                    );
                    last_state = state;
                }
                Err(_) => {
                    last_state = format!("{last_state} (probe still running at deadline)");
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep_until(std::cmp::min(now + self.interval, deadline)).await;
        }

        Err(WaitError::new(self.resource, self.timeout, start.elapsed())
            .with_state(last_state)
            .with_attempts(attempts)
            .into())
    }
}
