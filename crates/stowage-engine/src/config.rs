//! Engine tuning knobs.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Configuration shared by every job a manager runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent workers per job.
    pub workers: usize,
    /// Capacity of the work queue input channel (backpressure on discovery).
    pub queue_capacity: usize,
    /// Capacity of the outcome channel.
    pub result_capacity: usize,
    /// Buffer size of each in-memory pipe between stages and sinks.
    pub pipe_capacity: usize,
    /// Read buffer used when copying a pipeline tail into the fan-out.
    pub copy_buffer: usize,
    /// Outcomes tallied locally before one locked counter update.
    pub flush_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 64,
            result_capacity: 64,
            pipe_capacity: 64 * 1024,
            copy_buffer: 64 * 1024,
            flush_every: 10,
        }
    }
}

impl EngineConfig {
    /// Reject zero-sized pools and buffers.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("result_capacity", self.result_capacity),
            ("pipe_capacity", self.pipe_capacity),
            ("copy_buffer", self.copy_buffer),
            ("flush_every", self.flush_every),
        ];
        for (key, value) in fields {
            if value == 0 {
                return Err(EngineError::InvalidOption {
                    component: "engine".to_string(),
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}
