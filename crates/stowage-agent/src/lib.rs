#![warn(missing_docs)]

//! Stowage agent: loads configuration, sets up logging and runs backup and restore jobs
//! on the stowage engine.

pub mod cli;
pub mod config;
pub mod runner;

pub use cli::{Cli, Command};
pub use config::AgentConfig;
pub use runner::{load_definition, run_job};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let (plain, json) = if json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init();
}
