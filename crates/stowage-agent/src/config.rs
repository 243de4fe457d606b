//! Agent configuration file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use stowage_engine::EngineConfig;

/// Everything the agent reads from its configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Worker pool and buffer sizes.
    pub engine: EngineConfig,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Emit JSON log lines.
    pub json_logs: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            log_filter: String::from("info"),
            json_logs: false,
        }
    }
}

impl AgentConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: AgentConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.engine.validate()?;
        Ok(config)
    }
}
