//! Runs one job from a definition file to completion.

use crate::config::AgentConfig;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use stowage_engine::{JobDefinition, JobId, JobKind, JobStatus, Manager, TracingNotifier};
use tracing::{info, warn};

/// Read a job definition file.
pub fn load_definition(path: &Path) -> anyhow::Result<JobDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading job definition {}", path.display()))?;
    Ok(JobDefinition::from_json(&raw)?)
}

/// Submit a job and wait for it, cancelling on Ctrl-C.
pub async fn run_job(
    config: &AgentConfig,
    kind: JobKind,
    definition: JobDefinition,
    id: Option<JobId>,
) -> anyhow::Result<JobStatus> {
    let manager = Manager::with_builtins(config.engine.clone(), Arc::new(TracingNotifier))?;
    let handle = manager.submit(kind, definition, id)?;
    let id = handle.id().clone();
    info!(job_id = %id, %kind, "running job");

    let wait = handle.wait();
    tokio::pin!(wait);
    let status = tokio::select! {
        status = &mut wait => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %id, "interrupt received, cancelling job");
            if let Err(e) = manager.cancel(&id) {
                warn!(job_id = %id, error = %e, "cancel failed");
            }
            wait.await?
        }
    };
    Ok(status)
}
