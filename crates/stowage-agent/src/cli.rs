//! Command-line interface.

use crate::config::AgentConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stowage_engine::JobKind;

/// Stowage agent command line.
#[derive(Debug, Parser)]
#[command(name = "stowage-agent")]
#[command(about = "Runs Stowage backup and restore jobs", long_about = None)]
pub struct Cli {
    /// Agent configuration file (.toml or .json).
    #[arg(short, long, env = "STOWAGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    pub json: bool,

    /// What to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Job subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Back up the paths named in a job definition.
    Backup {
        /// Job definition file (JSON).
        #[arg(short, long)]
        job: PathBuf,
        /// Job id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },
    /// Restore the signatures listed in a job definition.
    Restore {
        /// Job definition file (JSON).
        #[arg(short, long)]
        job: PathBuf,
        /// Job id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },
}

impl Command {
    /// Job kind, definition file and optional id.
    pub fn job(&self) -> (JobKind, &PathBuf, Option<&str>) {
        match self {
            Command::Backup { job, id } => (JobKind::Backup, job, id.as_deref()),
            Command::Restore { job, id } => (JobKind::Restore, job, id.as_deref()),
        }
    }
}

impl Cli {
    /// Load the configuration file if one was given and exists.
    ///
    /// Returns the path of a configured file that was missing so the caller can warn once
    /// logging is up.
    pub fn load_config(&self) -> anyhow::Result<(AgentConfig, Option<PathBuf>)> {
        match &self.config {
            Some(path) if path.exists() => Ok((AgentConfig::from_file(path)?, None)),
            Some(path) => Ok((AgentConfig::default(), Some(path.clone()))),
            None => Ok((AgentConfig::default(), None)),
        }
    }
}
