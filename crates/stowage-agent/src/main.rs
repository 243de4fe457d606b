#![warn(missing_docs)]

//! Stowage agent binary.

use anyhow::Result;
use clap::Parser;
use stowage_agent::{init_tracing, load_definition, run_job, Cli};
use stowage_engine::{JobId, JobState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, missing) = cli.load_config()?;
    init_tracing(&config.log_filter, cli.json || config.json_logs);
    if let Some(path) = missing {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
    }

    let (kind, job_file, id) = cli.command.job();
    let definition = load_definition(job_file)?;
    let status = run_job(&config, kind, definition, id.map(JobId::from)).await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    match status.state {
        JobState::Finished => Ok(()),
        state => anyhow::bail!(
            "job {} ended {}: {}",
            status.job_id,
            state,
            status.message.as_deref().unwrap_or("no details")
        ),
    }
}
