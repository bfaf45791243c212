//! Operation-scoped retry with a diagnose-and-fix step between attempts.
//!
//! Each operation owns an [`AttemptRecord`]. The policy runs the attempt,
//! and on a retryable failure asks the attempt to diagnose and fix the cause
//! before backing off and trying again, up to `bound` additional attempts.
//! The policy never decides what a fix is; that belongs to the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::RetrySection;
use crate::errors::GatewayError;

/// Attempt bookkeeping for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub operation: String,
    /// Additional attempts allowed after the first.
    pub bound: u32,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    #[serde(default)]
    pub fixes_attempted: Vec<String>,
}

impl AttemptRecord {
    pub fn new(operation: impl Into<String>, bound: u32) -> Self {
        Self {
            operation: operation.into(),
            bound,
            attempts: 0,
            last_failure: None,
            fixes_attempted: Vec::new(),
        }
    }

    /// Total attempts this record may make.
    pub fn max_attempts(&self) -> u32 {
        self.bound + 1
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts()
    }
}

/// Failure of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// The external tool failed; eligible for diagnose-and-fix.
    Retryable(String),
    /// The gateway rejected the request; never retried.
    Fatal(GatewayError),
}

impl From<GatewayError> for AttemptError {
    fn from(err: GatewayError) -> Self {
        if err.is_retryable() {
            AttemptError::Retryable(err.to_string())
        } else {
            AttemptError::Fatal(err)
        }
    }
}

/// A fallible operation run under the retry policy.
#[async_trait]
pub trait Attempt: Send {
    type Output: Send;

    async fn run(&mut self) -> Result<Self::Output, AttemptError>;

    /// Diagnose a failure and apply a fix before the next attempt.
    ///
    /// Returns a description of the fix applied, or `None` when no fix was
    /// found (the next attempt still runs). An error here is a rejected fix
    /// and ends the loop.
    async fn diagnose(
        &mut self,
        failure: &str,
        record: &AttemptRecord,
    ) -> Result<Option<String>, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    ExhaustedRetries { last_failure: String },
    Rejected(GatewayError),
    /// The run was blocked elsewhere while this operation was in flight.
    Halted,
}

/// Shared cancellation flag, raised when the run enters `Blocked`.
#[derive(Debug, Clone, Default)]
pub struct HaltFlag(Arc<AtomicBool>);

impl HaltFlag {
    pub fn halt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    bound: u32,
    backoff: Duration,
    max_backoff: Duration,
    classes: BTreeMap<String, u32>,
}

impl RetryPolicy {
    pub fn new(bound: u32, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            bound,
            backoff,
            max_backoff,
            classes: BTreeMap::new(),
        }
    }

    pub fn from_config(section: &RetrySection) -> Self {
        Self {
            bound: section.bound,
            backoff: Duration::from_millis(section.backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
            classes: section.classes.clone(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>, bound: u32) -> Self {
        self.classes.insert(class.into(), bound);
        self
    }

    pub fn bound(&self) -> u32 {
        self.bound
    }

    pub fn bound_for(&self, class: Option<&str>) -> u32 {
        class
            .and_then(|c| self.classes.get(c).copied())
            .unwrap_or(self.bound)
    }

    /// A fresh record for `operation`, bounded by its class override if any.
    pub fn record(&self, operation: impl Into<String>, class: Option<&str>) -> AttemptRecord {
        AttemptRecord::new(operation, self.bound_for(class))
    }

    /// Exponential backoff after the given number of failed attempts, capped.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `attempt` until it succeeds, is rejected, or exhausts `record`.
    pub async fn execute<A: Attempt>(
        &self,
        record: &mut AttemptRecord,
        attempt: &mut A,
        halt: &HaltFlag,
    ) -> RetryOutcome<A::Output> {
        loop {
            if halt.is_halted() {
                return RetryOutcome::Halted;
            }

            record.attempts += 1;
            let failure = match attempt.run().await {
                Ok(output) => return RetryOutcome::Succeeded(output),
                Err(AttemptError::Fatal(err)) => return RetryOutcome::Rejected(err),
                Err(AttemptError::Retryable(failure)) => failure,
            };
            record.last_failure = Some(failure.clone());

            if record.exhausted() {
                tracing::warn!(
                    operation = %record.operation,
                    attempts = record.attempts,
                    "retries exhausted"
                );
                return RetryOutcome::ExhaustedRetries {
                    last_failure: failure,
                };
            }
            if halt.is_halted() {
                return RetryOutcome::Halted;
            }

            match attempt.diagnose(&failure, record).await {
                Ok(Some(fix)) => {
                    tracing::info!(operation = %record.operation, fix = %fix, "applied fix");
                    record.fixes_attempted.push(fix);
                }
                Ok(None) => {}
                Err(err) => return RetryOutcome::Rejected(err),
            }

            let delay = self.backoff_for(record.attempts);
            tracing::debug!(
                operation = %record.operation,
                attempt = record.attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
