//! Fixed-delay retry policy for connection establishment.
//!
//! [`RetryPolicy`] is plain data: how many attempts, how long to wait between
//! them. [`retry`] drives an arbitrary async action under a policy, logging
//! each failure and sleeping through the caller's [`Context`] so that
//! cancellation and deadlines interrupt the wait.

use crate::db::context::Context;
use crate::db::driver::PoolHandle;
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 0 means unbounded.
    retry_count: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, delay: Duration) -> Self {
        Self { retry_count, delay }
    }

    /// Retry until success, never giving up.
    pub fn forever(delay: Duration) -> Self {
        Self::new(0, delay)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_unbounded(&self) -> bool {
        self.retry_count == 0
    }

    /// `None` when unbounded.
    pub fn max_attempts(&self) -> Option<u64> {
        (!self.is_unbounded()).then_some(u64::from(self.retry_count))
    }

    /// Whether another attempt is allowed after `completed` attempts have failed.
    pub fn should_retry(&self, completed: u64) -> bool {
        match self.max_attempts() {
            Some(max) => completed < max,
            None => true,
        }
    }

    /// Zero-based attempt indices permitted by this policy.
    pub fn attempts(&self) -> Attempts {
        Attempts {
            next: 0,
            step: if self.is_unbounded() { 0 } else { 1 },
            remaining: u64::from(self.retry_count.max(1)),
        }
    }
}

/// Iterator over attempt indices.
///
/// Counts `remaining` down by `step` each pass; an unbounded policy uses a
/// step of zero so the counter never reaches the end.
#[derive(Debug, Clone)]
pub struct Attempts {
    next: u64,
    step: u64,
    remaining: u64,
}

impl Iterator for Attempts {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= self.step;
        let attempt = self.next;
        self.next = self.next.saturating_add(1);
        Some(attempt)
    }
}

/// Run `action` until it succeeds or the policy is exhausted.
///
/// `action` receives the zero-based attempt index. Every failure is logged
/// with that index under `component`. The delay is skipped after the final
/// permitted attempt. On exhaustion the last error is returned inside
/// [`DbError::RetriesExhausted`]. Cancellation or an expired deadline on `ctx`
/// ends the loop immediately with that error instead.
pub async fn retry<P, T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &Context<P>,
    component: &str,
    mut action: F,
) -> DbResult<T>
where
    P: PoolHandle,
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut last_error = None;
    let mut completed = 0u64;

    for attempt in policy.attempts() {
        let err = match ctx.run("connection attempt", action(attempt)).await {
            Ok(value) => return Ok(value),
            Err(err @ (DbError::Cancelled { .. } | DbError::Timeout { .. }))
                if ctx.is_done() =>
            {
                return Err(err);
            }
            Err(err) => err,
        };
        completed += 1;

        warn!(
            component = component,
            attempt = attempt,
            error = %err,
            "Unable to connect, reconnecting"
        );
        last_error = Some(err);

        if policy.should_retry(completed) {
            ctx.sleep(policy.delay()).await?;
        }
    }

    let last =
        last_error.unwrap_or_else(|| DbError::internal("retry policy permitted no attempts"));
    Err(DbError::retries_exhausted(completed, last))
}
