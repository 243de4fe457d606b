//! Fire-and-forget event handoff to whatever ships results to the coordinator.

use crate::job::{JobId, JobStatus};
use crate::processor::{Outcome, OutcomeState};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Something a job reports while running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// One item finished.
    FileResult {
        /// Owning job.
        job_id: JobId,
        /// Item outcome.
        outcome: Outcome,
    },
    /// The job reached a terminal state.
    JobFinished {
        /// Job that finished.
        job_id: JobId,
        /// Final status.
        status: JobStatus,
    },
}

/// Receives events. Must not block; the engine never waits for delivery.
pub trait Notifier: Send + Sync {
    /// Hand off one event.
    fn send(&self, event: Event);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, _event: Event) {}
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send(&self, event: Event) {
        match event {
            Event::FileResult { job_id, outcome } => match outcome.state {
                OutcomeState::Errors => warn!(
                    %job_id,
                    path = %outcome.signature.path,
                    error = outcome.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                    "file failed"
                ),
                state => info!(%job_id, path = %outcome.signature.path, ?state, "file done"),
            },
            Event::JobFinished { job_id, status } => info!(
                %job_id,
                state = %status.state,
                total = status.total,
                complete = status.complete,
                skipped = status.skipped,
                errors = status.errors,
                "job finished"
            ),
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelNotifier {
    /// Notifier and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn send(&self, event: Event) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}
