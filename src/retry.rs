//! Bounded retry decisions for failed conversion attempts.

use crate::error::{ConversionError, ErrorKind, JobFailure};
use crate::job::ConversionJob;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// What the queue should do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-append the job to the tail of the queue.
    Retry,
    /// Finalize the job with the given caller-facing failure.
    Fail(JobFailure),
}

/// Decides between requeue and final failure. Pure; the queue applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn decide(&self, error: &ConversionError, job: &ConversionJob) -> RetryDecision {
        match error.kind() {
            ErrorKind::UnsupportedFormat => RetryDecision::Fail(JobFailure::NotSupported),
            ErrorKind::EngineFailure if job.retry_count < self.max_retries => RetryDecision::Retry,
            ErrorKind::EngineFailure => RetryDecision::Fail(JobFailure::ConversionFailed),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
