//! Retry-wrapped step execution with exponential backoff and jitter.
//!
//! `RetryPolicy` is the clamped form of a step's `RetryConfig`. Attempts are
//! 1-based; the delay before attempt `n` (n >= 2) is
//! `floor(delay * multiplier^(n-1) + uniform(0, jitter))` milliseconds.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use scriptflow_types::execution::{ExecutionContext, StepResult};
use scriptflow_types::workflow::{RetryConfig, Step};

use super::state::RunState;
use super::step_runner::{StepError, StepExecutor};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Normalized retry settings for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// One attempt, no delay.
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_ms: 0,
        }
    }

    /// Clamp an operator-supplied config: `max_attempts >= 1`, `delay >= 0`,
    /// `multiplier >= 1` and finite, `jitter >= 0`.
    pub fn from_config(config: Option<&RetryConfig>) -> Self {
        let Some(config) = config else {
            return Self::single_attempt();
        };

        let backoff_multiplier = if config.backoff_multiplier.is_finite() {
            config.backoff_multiplier.max(1.0)
        } else {
            1.0
        };

        Self {
            max_attempts: config.max_attempts.clamp(1, i64::from(u32::MAX)) as u32,
            delay_ms: config.delay_ms.max(0) as u64,
            backoff_multiplier,
            jitter_ms: config.jitter_ms.max(0) as u64,
        }
    }

    /// Whether another attempt may follow `attempt`.
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait before running `attempt`. Zero for the first attempt.
    pub fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let jitter = if self.jitter_ms > 0 {
            rng.gen_range(0.0..=self.jitter_ms as f64)
        } else {
            0.0
        };

        // Float-to-int casts saturate, so an overflowing backoff caps out.
        Duration::from_millis((base + jitter).floor() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

// ---------------------------------------------------------------------------
// execute_step
// ---------------------------------------------------------------------------

/// Run a step through `executor`, retrying failures per the step's policy.
///
/// Never returns an error: the last failure after exhaustion is reported
/// unchanged in the `StepResult`. Cancellation during a backoff sleep ends
/// the loop with a `Workflow cancelled` failure.
pub async fn execute_step<X, R>(
    executor: &X,
    step: &Step,
    payload: &Value,
    ctx: &ExecutionContext,
    state: &mut RunState,
    rng: &mut R,
    cancel: &CancellationToken,
) -> StepResult
where
    X: StepExecutor,
    R: Rng + Send,
{
    let policy = RetryPolicy::from_config(step.retry.as_ref());
    let mut attempt = 1;

    loop {
        match executor.run_once(step, payload, ctx, state, cancel).await {
            Ok(output) => return StepResult::ok(output),
            Err(e) => {
                let reason = e.to_string();
                if !policy.has_attempts_remaining(attempt) || matches!(e, StepError::Cancelled) {
                    tracing::debug!(
                        step_id = step.id.as_str(),
                        attempt,
                        error = reason.as_str(),
                        "step failed"
                    );
                    return StepResult::failed(reason);
                }

                attempt += 1;
                state.log(format!(
                    "Retrying step \"{}\" (attempt {}/{}) after error: {}",
                    step.label, attempt, policy.max_attempts, reason
                ));
                tracing::info!(
                    step_id = step.id.as_str(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    "retrying step"
                );

                let delay = policy.delay_for_attempt(attempt, rng);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return StepResult::failed(StepError::Cancelled.to_string());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
