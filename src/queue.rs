//! In-memory FIFO conversion queue with a single global "busy" slot.
//!
//! The engine tolerates exactly one conversion at a time, so the queue never
//! starts a job while another one holds the busy slot. A drain attempt that
//! finds the slot taken arms a single debounced timer and tries again later;
//! every finished execution releases the slot and drains again, which is what
//! keeps the queue moving.
//!
//! While the engine is down (crashed, being reaped or still booting) the
//! queue is suspended: submissions and retries accumulate in `pending` and
//! nothing is dispatched until the supervisor resumes it.

use crate::converter::{execute_isolated, DocumentConverter};
use crate::error::ConversionError;
use crate::job::{ConversionJob, JobResult, QueuedJob};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::telemetry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default delay before a drain attempt that hit a busy queue is repeated.
pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_millis(500);

/// Handle to the conversion queue. Clones share the same queue.
#[derive(Clone)]
pub struct ConversionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    converter: Arc<dyn DocumentConverter>,
    policy: RetryPolicy,
    drain_delay: Duration,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    busy: bool,
    /// Dispatch ticket of the execution that currently owns `busy`.
    in_flight: Option<u64>,
    next_ticket: u64,
    drain_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the drain timer is replaced or cancelled.
    timer_generation: u64,
    /// Set while no engine listener is accepting work.
    engine_down: bool,
}

impl ConversionQueue {
    pub fn new(converter: Arc<dyn DocumentConverter>, policy: RetryPolicy) -> Self {
        Self::with_drain_delay(converter, policy, DEFAULT_DRAIN_DELAY)
    }

    pub fn with_drain_delay(
        converter: Arc<dyn DocumentConverter>,
        policy: RetryPolicy,
        drain_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                converter,
                policy,
                drain_delay,
            }),
        }
    }

    /// Appends a job to the tail of the queue and triggers a drain.
    ///
    /// # Arguments
    ///
    /// * `job` - The conversion job to enqueue
    ///
    /// # Returns
    ///
    /// A receiver that resolves exactly once with the job's terminal outcome,
    /// or with a `RecvError` if the job was discarded by
    /// [`ConversionQueue::reset`] before it started.
    pub fn submit(&self, job: ConversionJob) -> oneshot::Receiver<JobResult> {
        info!(
            job_id = %job.job_id,
            source = %job.source_path.display(),
            "Queueing conversion job"
        );

        let (entry, rx) = QueuedJob::new(job);
        self.inner.state.lock().pending.push_back(entry);
        self.drain();
        rx
    }

    /// Submits a conversion and waits for its outcome.
    ///
    /// # Arguments
    ///
    /// * `source_path` - Document to convert; must stay readable until the job finishes
    /// * `dest_path` - Where the PDF is written; only created on success
    ///
    /// # Returns
    ///
    /// `Some(Ok(dest_path))` on success, `Some(Err(failure))` on a terminal
    /// failure, or `None` when the job was abandoned by a reset.
    pub async fn convert(&self, source_path: PathBuf, dest_path: PathBuf) -> Option<JobResult> {
        self.submit(ConversionJob::new(source_path, dest_path)).await.ok()
    }

    /// Starts the head job if the engine slot is free.
    ///
    /// When the slot is taken, (re)arms the single deferred drain instead.
    /// Does nothing while the queue is suspended.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        if state.pending.is_empty() {
            return;
        }

        if state.engine_down {
            debug!(pending = state.pending.len(), "Engine down, holding queued jobs");
            return;
        }

        if state.busy {
            self.schedule_drain(&mut state);
            return;
        }

        let Some(mut entry) = state.pending.pop_front() else {
            return;
        };
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.busy = true;
        state.in_flight = Some(ticket);
        drop(state);

        entry.job.start_processing();
        debug!(
            job_id = %entry.job.job_id,
            source = %entry.source_path().display(),
            retry_count = entry.job.retry_count,
            "Dispatching conversion job"
        );

        let queue = self.clone();
        tokio::spawn(async move { queue.dispatch(entry, ticket).await });
    }

    /// Discards every job that has not started yet and frees the busy slot.
    ///
    /// The discarded jobs' completions never fire. A job already running is
    /// left alone and still completes.
    ///
    /// # Returns
    ///
    /// The number of discarded jobs.
    pub fn reset(&self) -> usize {
        let discarded = {
            let mut state = self.inner.state.lock();
            let discarded = std::mem::take(&mut state.pending);
            state.busy = false;
            state.in_flight = None;
            Self::cancel_drain_timer(&mut state);
            discarded
        };

        warn!(discarded = discarded.len(), "Conversion queue reset");
        discarded.len()
    }

    /// Number of jobs waiting to start.
    pub fn size(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().busy
    }

    /// Stops dispatching because the engine is gone, and frees the busy slot
    /// held by whatever was running against it.
    ///
    /// Jobs keep accumulating until [`ConversionQueue::resume`].
    pub fn suspend(&self) {
        let mut state = self.inner.state.lock();
        if state.busy {
            warn!(ticket = ?state.in_flight, "Releasing conversion slot held by a dead engine");
        }
        state.busy = false;
        state.in_flight = None;
        state.engine_down = true;
        Self::cancel_drain_timer(&mut state);
    }

    /// Re-enables dispatching once an engine accepts work, and drains.
    pub fn resume(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.engine_down = false;
            state.pending.len()
        };
        info!(pending, "Engine ready, resuming conversion queue");
        self.drain();
    }

    /// Whether dispatching is currently held back by [`ConversionQueue::suspend`].
    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().engine_down
    }

    async fn dispatch(self, entry: QueuedJob, ticket: u64) {
        let result = execute_isolated(self.inner.converter.clone(), entry.job.clone()).await;

        let finished = {
            let mut state = self.inner.state.lock();
            let finished = self.settle(&mut state, entry, result);

            // A reset or engine restart may have handed the slot to a newer job.
            if state.in_flight == Some(ticket) {
                state.busy = false;
                state.in_flight = None;
            }
            finished
        };

        if let Some(job) = finished {
            telemetry::record_job_telemetry(&job);
        }

        self.drain();
    }

    /// Applies the retry policy to a finished attempt. Returns the job if it
    /// reached a terminal state.
    fn settle(
        &self,
        state: &mut QueueState,
        mut entry: QueuedJob,
        result: Result<(), ConversionError>,
    ) -> Option<ConversionJob> {
        match result {
            Ok(()) => {
                entry.job.mark_complete();
                let dest = entry.job.dest_path.clone();
                Some(entry.complete(Ok(dest)))
            }
            Err(error) => match self.inner.policy.decide(&error, &entry.job) {
                RetryDecision::Retry => {
                    entry.job.requeue(error.to_string());
                    info!(
                        job_id = %entry.job.job_id,
                        retry_count = entry.job.retry_count,
                        "Conversion failed, job re-queued: {}",
                        error
                    );
                    state.pending.push_back(entry);
                    None
                }
                RetryDecision::Fail(failure) => {
                    warn!(
                        job_id = %entry.job.job_id,
                        retry_count = entry.job.retry_count,
                        max_retries = self.inner.policy.max_retries(),
                        transient = error.is_transient(),
                        "Conversion failed permanently: {}",
                        error
                    );
                    entry.job.mark_failed(error.to_string());
                    Some(entry.complete(Err(failure)))
                }
            },
        }
    }

    fn schedule_drain(&self, state: &mut QueueState) {
        Self::cancel_drain_timer(state);

        let generation = state.timer_generation;
        let delay = self.inner.drain_delay;
        let queue = self.clone();
        state.drain_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = queue.inner.state.lock();
                if state.timer_generation != generation {
                    return;
                }
                state.drain_timer = None;
            }
            queue.drain();
        }));
    }

    fn cancel_drain_timer(state: &mut QueueState) {
        state.timer_generation += 1;
        if let Some(timer) = state.drain_timer.take() {
            timer.abort();
        }
    }
}
