//! Work item discovery: file-tree walks for backup, signature lists for restore.

use crate::cancel::CancelSignal;
use crate::definition::PathSpec;
use crate::error::EngineError;
use crate::job::JobMeta;
use crate::processor::{FileTask, Plan, Unit};
use crate::queue::Submitter;
use crate::signature::Signature;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// What a discovery run produced.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Items handed on.
    pub emitted: u64,
    /// Entries that could not be read. The walk skipped them and continued.
    pub errors: Vec<EngineError>,
    /// True if cancellation stopped discovery before every item was emitted.
    pub interrupted: bool,
}

/// Start walking `roots` on a blocking thread.
///
/// Regular files that are not below an exclude are sent into the returned receiver, which
/// holds at most `capacity` paths. The walk stops when `cancel` fires or the receiver is
/// dropped, whichever it notices first.
pub fn walk(
    roots: Vec<PathSpec>,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<PathBuf>, JoinHandle<DiscoveryReport>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || walk_blocking(&roots, &tx, &cancel));
    (rx, handle)
}

fn is_excluded(path: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|x| path.starts_with(x))
}

fn walk_blocking(
    roots: &[PathSpec],
    tx: &mpsc::Sender<PathBuf>,
    cancel: &CancellationToken,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    for spec in roots {
        let excludes = spec.resolved_excludes();
        let entries = WalkDir::new(&spec.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_excluded(entry.path(), &excludes));

        for entry in entries {
            if cancel.is_cancelled() {
                report.interrupted = true;
                return report;
            }
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if tx.blocking_send(entry.into_path()).is_err() {
                        report.interrupted = true;
                        return report;
                    }
                    report.emitted += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| spec.root.clone());
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    report.errors.push(EngineError::Walk {
                        path,
                        msg: err.to_string(),
                    });
                }
            }
        }
    }
    report
}

/// Walk every backup root and submit each file to the queue until done or cancelled.
pub async fn feed_backup(
    roots: Vec<PathSpec>,
    plan: Arc<Plan>,
    submitter: Submitter<FileTask>,
    meta: Arc<JobMeta>,
    cancel: CancelSignal,
    capacity: usize,
) -> DiscoveryReport {
    let (mut paths, walker) = walk(roots, capacity, cancel.token());
    let mut submitted = 0u64;
    let mut interrupted = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.fired() => None,
            path = paths.recv() => path,
        };
        let Some(path) = next else { break };
        meta.add_total(1);
        if submitter
            .add(FileTask::new(Unit::Backup(path), plan.clone()))
            .await
            .is_err()
        {
            interrupted = true;
            break;
        }
        submitted += 1;
    }
    drop(paths);
    submitter.finish();

    let mut report = match walker.await {
        Ok(report) => report,
        Err(e) => DiscoveryReport {
            errors: vec![EngineError::Join(format!("walk task: {e}"))],
            ..Default::default()
        },
    };
    report.interrupted |= interrupted || cancel.is_fired();
    report.emitted = submitted;
    debug!(
        submitted,
        errors = report.errors.len(),
        interrupted = report.interrupted,
        "backup discovery done"
    );
    report
}

/// Submit every stored signature to the queue until done or cancelled.
pub async fn feed_restore(
    files: Vec<Signature>,
    plan: Arc<Plan>,
    submitter: Submitter<FileTask>,
    meta: Arc<JobMeta>,
    cancel: CancelSignal,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    for signature in files {
        if cancel.is_fired() {
            report.interrupted = true;
            break;
        }
        meta.add_total(1);
        if submitter
            .add(FileTask::new(Unit::Restore(signature), plan.clone()))
            .await
            .is_err()
        {
            report.interrupted = true;
            break;
        }
        report.emitted += 1;
    }
    submitter.finish();
    debug!(submitted = report.emitted, interrupted = report.interrupted, "restore discovery done");
    report
}
