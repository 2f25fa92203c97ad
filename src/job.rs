//! Conversion job model and completion handle.

use crate::error::JobFailure;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Final result delivered to whoever submitted a job.
pub type JobResult = Result<PathBuf, JobFailure>;

/// One document-to-PDF conversion request.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub job_id: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl ConversionJob {
    pub fn new(source_path: impl Into<PathBuf>, dest_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            status: JobStatus::Queued,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn start_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self) {
        self.status = JobStatus::Complete;
        self.updated_at = Utc::now();
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    /// Puts the job back into the queued state for another attempt.
    ///
    /// Whether a retry is allowed is decided by [`crate::retry::RetryPolicy`];
    /// this only records it.
    pub fn requeue(&mut self, error: String) {
        self.retry_count += 1;
        self.status = JobStatus::Queued;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.status == JobStatus::Complete || self.status == JobStatus::Failed {
            Some(self.updated_at.signed_duration_since(self.created_at).num_milliseconds())
        } else {
            None
        }
    }
}

/// A job waiting in the queue together with its one-shot completion.
///
/// [`QueuedJob::complete`] consumes the entry, so a completion can fire at
/// most once. Dropping an entry without completing it (queue reset) closes
/// the channel instead.
#[derive(Debug)]
pub struct QueuedJob {
    pub job: ConversionJob,
    completion: oneshot::Sender<JobResult>,
}

impl QueuedJob {
    pub fn new(job: ConversionJob) -> (Self, oneshot::Receiver<JobResult>) {
        let (completion, rx) = oneshot::channel();
        (Self { job, completion }, rx)
    }

    pub fn source_path(&self) -> &Path {
        &self.job.source_path
    }

    /// Delivers the terminal outcome. Returns the finished job for telemetry.
    pub fn complete(self, result: JobResult) -> ConversionJob {
        if self.completion.send(result).is_err() {
            tracing::debug!(job_id = %self.job.job_id, "Job submitter is no longer waiting");
        }
        self.job
    }
}
