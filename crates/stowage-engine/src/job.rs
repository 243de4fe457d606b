//! Job orchestration: discovery, the worker pool, outcome aggregation and the state machine.

use crate::backend::BackendRegistry;
use crate::cancel::CancelSignal;
use crate::config::EngineConfig;
use crate::definition::{JobDefinition, JobKind};
use crate::discovery::{feed_backup, feed_restore, DiscoveryReport};
use crate::error::{EngineError, Result};
use crate::notify::{Event, Notifier};
use crate::processor::{FileTask, Outcome, OutcomeState, Plan};
use crate::queue::WorkQueue;
use crate::transform::TransformRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet running.
    New,
    /// Discovering and processing items.
    Running,
    /// Cancellation requested; draining.
    Canceling,
    /// Stopped by cancellation before every item was processed.
    Canceled,
    /// Every discovered item produced an outcome.
    Finished,
    /// Ended with a job-level failure.
    Failed,
}

impl JobState {
    /// True for `Canceled`, `Finished` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Canceled | JobState::Finished | JobState::Failed)
    }

    fn can_become(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (New, Running)
                | (Running, Canceling)
                | (Running, Finished)
                | (Running, Failed)
                | (Canceling, Canceled)
                | (Canceling, Finished)
                | (Canceling, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "new",
            JobState::Running => "running",
            JobState::Canceling => "canceling",
            JobState::Canceled => "canceled",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of a job's aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job identifier.
    pub job_id: JobId,
    /// Backup or restore.
    pub kind: JobKind,
    /// Current state.
    pub state: JobState,
    /// When the job started running.
    pub start: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub end: Option<DateTime<Utc>>,
    /// Items discovered and handed to the queue.
    pub total: u64,
    /// Items stored or restored.
    pub complete: u64,
    /// Items no backend wanted.
    pub skipped: u64,
    /// Items that failed.
    pub errors: u64,
    /// Items discovered but never processed because the job was cancelled.
    pub abandoned: u64,
    /// Entries the file-tree walk could not read.
    pub discovery_errors: u64,
    /// Human readable summary or failure reason.
    pub message: Option<String>,
}

impl JobStatus {
    fn new(job_id: JobId, kind: JobKind) -> Self {
        Self {
            job_id,
            kind,
            state: JobState::New,
            start: None,
            end: None,
            total: 0,
            complete: 0,
            skipped: 0,
            errors: 0,
            abandoned: 0,
            discovery_errors: 0,
            message: None,
        }
    }

    /// Outcomes counted so far.
    pub fn processed(&self) -> u64 {
        self.complete + self.skipped + self.errors
    }

    /// `complete + skipped + errors == total`.
    pub fn is_balanced(&self) -> bool {
        self.processed() == self.total
    }
}

/// Outcome counts accumulated between two flushes into [`JobMeta`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Complete outcomes.
    pub complete: u64,
    /// Skipped outcomes.
    pub skipped: u64,
    /// Failed outcomes.
    pub errors: u64,
}

impl Tally {
    /// Count one outcome.
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome.state {
            OutcomeState::Complete => self.complete += 1,
            OutcomeState::Skipped => self.skipped += 1,
            OutcomeState::Errors => self.errors += 1,
        }
    }

    /// Outcomes counted.
    pub fn len(&self) -> u64 {
        self.complete + self.skipped + self.errors
    }

    /// True if nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the counts and reset to zero.
    pub fn take(&mut self) -> Tally {
        std::mem::take(self)
    }
}

/// Aggregate job state shared between the orchestrator and its tasks.
///
/// All mutation goes through the accessors, each under one lock.
#[derive(Debug)]
pub struct JobMeta {
    inner: Mutex<JobStatus>,
}

impl JobMeta {
    /// Fresh metadata in state `New`.
    pub fn new(job_id: JobId, kind: JobKind) -> Self {
        Self {
            inner: Mutex::new(JobStatus::new(job_id, kind)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobStatus> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> JobStatus {
        self.lock().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.lock().state
    }

    /// Count newly discovered items.
    pub fn add_total(&self, n: u64) {
        self.lock().total += n;
    }

    /// Fold a batch of outcome counts in.
    pub fn add_outcomes(&self, tally: &Tally) {
        let mut status = self.lock();
        status.complete += tally.complete;
        status.skipped += tally.skipped;
        status.errors += tally.errors;
    }

    /// Record discovery errors, keeping the first message.
    pub fn add_discovery_errors(&self, errors: &[EngineError]) {
        let Some(first) = errors.first() else { return };
        let mut status = self.lock();
        if status.discovery_errors == 0 {
            status.message = Some(format!("discovery failed: {first}"));
        }
        status.discovery_errors += errors.len() as u64;
    }

    /// Move to `next` if the transition is legal.
    pub fn set_state(&self, next: JobState) -> Result<()> {
        let mut status = self.lock();
        if !status.state.can_become(next) {
            return Err(EngineError::InvalidState {
                job_id: status.job_id.to_string(),
                action: "transition",
                state: status.state.to_string(),
            });
        }
        status.state = next;
        Ok(())
    }

    /// `New → Running`, recording the start time.
    pub fn begin(&self) -> Result<()> {
        let mut status = self.lock();
        if status.state != JobState::New {
            return Err(EngineError::InvalidState {
                job_id: status.job_id.to_string(),
                action: "run",
                state: status.state.to_string(),
            });
        }
        status.state = JobState::Running;
        status.start = Some(Utc::now());
        Ok(())
    }

    /// `Running → Canceling`. Returns `Ok(true)` only for the call that made the transition;
    /// repeated requests while canceling are `Ok(false)`.
    pub fn request_cancel(&self) -> Result<bool> {
        let mut status = self.lock();
        match status.state {
            JobState::Running => {
                status.state = JobState::Canceling;
                Ok(true)
            }
            JobState::Canceling => Ok(false),
            other => Err(EngineError::InvalidState {
                job_id: status.job_id.to_string(),
                action: "cancel",
                state: other.to_string(),
            }),
        }
    }

    /// Pick the terminal state after every outcome has been counted.
    ///
    /// Items that never produced an outcome move from `total` to `abandoned`. `interrupted`
    /// says whether discovery was cut short.
    pub fn settle(&self, interrupted: bool) -> JobStatus {
        let mut status = self.lock();
        let missing = status.total.saturating_sub(status.processed());
        status.abandoned = missing;
        status.total -= missing;
        status.end = Some(Utc::now());

        let canceling = status.state == JobState::Canceling;
        let (state, message) = if canceling && (interrupted || missing > 0) {
            (
                JobState::Canceled,
                Some(format!(
                    "canceled after {} of {} items",
                    status.processed(),
                    status.total + missing
                )),
            )
        } else if status.discovery_errors > 0 {
            (JobState::Failed, status.message.clone())
        } else if missing > 0 {
            (
                JobState::Failed,
                Some(format!("{missing} items never produced an outcome")),
            )
        } else if status.errors > 0 {
            (JobState::Finished, Some(format!("{} items failed", status.errors)))
        } else {
            (JobState::Finished, None)
        };
        status.state = state;
        status.message = message;

        if !status.is_balanced() {
            error!(
                job_id = %status.job_id,
                total = status.total,
                processed = status.processed(),
                "outcome counters do not add up"
            );
        }
        status.clone()
    }
}

/// The contract a job must satisfy to be run by a [`crate::Manager`].
#[async_trait]
pub trait ManagedJob: Send + Sync {
    /// Job identifier.
    fn id(&self) -> &JobId;

    /// `New → Running`. The manager calls this before spawning [`ManagedJob::run`].
    fn start(&self) -> Result<()>;

    /// Run to a terminal state, then send the id on `done`. Starts the job first if
    /// [`ManagedJob::start`] was not called.
    async fn run(&self, done: mpsc::Sender<JobId>) -> Result<JobStatus>;

    /// Request cooperative cancellation. Safe to call repeatedly.
    fn cancel(&self) -> Result<()>;

    /// Current aggregate state.
    fn status(&self) -> JobStatus;
}

/// One backup or restore job.
pub struct Job {
    id: JobId,
    kind: JobKind,
    definition: JobDefinition,
    plan: Arc<Plan>,
    config: EngineConfig,
    meta: Arc<JobMeta>,
    cancel: CancelSignal,
    notifier: Arc<dyn Notifier>,
    launched: AtomicBool,
}

impl Job {
    /// Resolve every component. Configuration errors are returned here, before anything runs.
    pub fn new(
        id: JobId,
        kind: JobKind,
        definition: JobDefinition,
        config: EngineConfig,
        backends: &BackendRegistry,
        transforms: &TransformRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let plan = Plan::build(kind, &definition, &config, backends, transforms)?;
        Ok(Self {
            meta: Arc::new(JobMeta::new(id.clone(), kind)),
            id,
            kind,
            definition,
            plan: Arc::new(plan),
            config,
            cancel: CancelSignal::new(),
            notifier,
            launched: AtomicBool::new(false),
        })
    }

    /// Backup or restore.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Shared aggregate state.
    pub fn meta(&self) -> Arc<JobMeta> {
        self.meta.clone()
    }
}

#[async_trait]
impl ManagedJob for Job {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn start(&self) -> Result<()> {
        self.meta.begin()?;
        debug!(job_id = %self.id, "job marked running");
        Ok(())
    }

    async fn run(&self, done: mpsc::Sender<JobId>) -> Result<JobStatus> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState {
                job_id: self.id.to_string(),
                action: "run",
                state: self.meta.state().to_string(),
            });
        }
        if self.meta.state() == JobState::New {
            self.meta.begin()?;
        }
        info!(job_id = %self.id, kind = %self.kind, workers = self.config.workers, "job started");

        let mut queue = WorkQueue::with_abort(
            self.config.queue_capacity,
            self.config.result_capacity,
            self.cancel.token(),
        );
        let results = queue.start(self.config.workers).ok_or(EngineError::QueueClosed)?;
        let submitter = queue.submitter().ok_or(EngineError::QueueClosed)?;
        queue.finish();

        let discovery = match self.kind {
            JobKind::Backup => tokio::spawn(feed_backup(
                self.definition.paths.clone(),
                self.plan.clone(),
                submitter,
                self.meta.clone(),
                self.cancel.clone(),
                self.config.queue_capacity,
            )),
            JobKind::Restore => tokio::spawn(feed_restore(
                self.definition.files.clone(),
                self.plan.clone(),
                submitter,
                self.meta.clone(),
                self.cancel.clone(),
            )),
        };
        let drain = tokio::spawn(drain(
            results,
            self.id.clone(),
            self.meta.clone(),
            self.notifier.clone(),
            self.config.flush_every,
        ));

        let report = discovery.await.unwrap_or_else(|e| DiscoveryReport {
            errors: vec![EngineError::Join(format!("discovery task: {e}"))],
            ..Default::default()
        });
        self.meta.add_discovery_errors(&report.errors);
        if let Err(e) = drain.await {
            error!(job_id = %self.id, error = %e, "drain task failed");
        }

        let status = self.meta.settle(report.interrupted);
        info!(
            job_id = %self.id,
            state = %status.state,
            total = status.total,
            complete = status.complete,
            skipped = status.skipped,
            errors = status.errors,
            abandoned = status.abandoned,
            "job ended"
        );
        self.notifier.send(Event::JobFinished {
            job_id: self.id.clone(),
            status: status.clone(),
        });
        if done.send(self.id.clone()).await.is_err() {
            debug!(job_id = %self.id, "completion receiver gone");
        }
        Ok(status)
    }

    fn cancel(&self) -> Result<()> {
        if self.meta.request_cancel()? {
            self.cancel.fire();
            info!(job_id = %self.id, "cancellation requested");
        } else {
            debug!(job_id = %self.id, "already canceling");
        }
        Ok(())
    }

    fn status(&self) -> JobStatus {
        self.meta.snapshot()
    }
}

/// Forward every outcome to the notifier and fold it into the counters.
///
/// Counts are flushed every `flush_every` outcomes and once more when the channel closes,
/// so each outcome is counted exactly once.
async fn drain(
    mut results: mpsc::Receiver<Outcome>,
    job_id: JobId,
    meta: Arc<JobMeta>,
    notifier: Arc<dyn Notifier>,
    flush_every: usize,
) {
    let flush_every = flush_every.max(1) as u64;
    let mut tally = Tally::default();
    while let Some(outcome) = results.recv().await {
        tally.record(&outcome);
        notifier.send(Event::FileResult {
            job_id: job_id.clone(),
            outcome,
        });
        if tally.len() >= flush_every {
            meta.add_outcomes(&tally.take());
        }
    }
    if !tally.is_empty() {
        meta.add_outcomes(&tally.take());
    }
}
