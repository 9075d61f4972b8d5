use crate::handler::{HandlerError, HandlerErrorKind};
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behaviour of the task queue (the `[queue]` config section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries granted to a task that does not set its own limit.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Treat handler timeouts as recoverable.
    #[serde(default = "default_true")]
    pub retry_timeouts: bool,
    /// Treat transient failures as recoverable.
    #[serde(default = "default_true")]
    pub retry_transient: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_timeouts: true,
            retry_transient: true,
        }
    }
}

impl RetryPolicy {
    /// Whether `err` deserves another attempt.
    ///
    /// Unknown agents and cancellations are never retried. Otherwise an
    /// explicit classification from the handler wins; without one, timeouts
    /// and transient failures are recoverable (per the flags) and everything
    /// else is not.
    pub fn is_recoverable(&self, err: &HandlerError) -> bool {
        match err.kind {
            HandlerErrorKind::UnknownAgent | HandlerErrorKind::Cancelled => false,
            kind => err.recoverable.unwrap_or(match kind {
                HandlerErrorKind::Timeout => self.retry_timeouts,
                HandlerErrorKind::Transient => self.retry_transient,
                _ => false,
            }),
        }
    }

    /// Delay before retry number `attempt` (1-based) becomes dequeuable.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, attempt.saturating_sub(1)))
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(MaestroError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

/// Exponential backoff capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, exponent: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    delay.min(policy.backoff_max_ms)
}
