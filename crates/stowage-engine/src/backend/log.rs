//! Backend that records what it was sent instead of storing bytes.

use super::{Backend, BoxReader, ErrorSink};
use crate::definition::Options;
use crate::error::{EngineError, Result};
use crate::signature::{ContentHash, Signature};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Registered name of the log backend.
pub const NAME: &str = "log";

/// One consumed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Source path from the signature.
    pub path: String,
    /// Content hash from the signature.
    pub content_hash: ContentHash,
    /// Bytes read from the stream.
    pub bytes: u64,
}

/// Shared, append-only list of log entries.
#[derive(Debug, Clone, Default)]
pub struct LogBook {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// Copy of every entry recorded so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Always participates; drains the stream and logs one entry per item.
#[derive(Debug, Clone)]
pub struct LogBackend {
    label: String,
    book: LogBook,
}

impl Default for LogBackend {
    fn default() -> Self {
        Self::with_book(LogBook::new())
    }
}

impl LogBackend {
    /// Backend appending to an existing book.
    pub fn with_book(book: LogBook) -> Self {
        Self {
            label: NAME.to_string(),
            book,
        }
    }

    /// Entries recorded by this backend.
    pub fn book(&self) -> &LogBook {
        &self.book
    }
}

#[async_trait]
impl Backend for LogBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, options: &Options) -> Result<()> {
        if let Some(label) = options.get("label") {
            if label.trim().is_empty() {
                return Err(EngineError::InvalidOption {
                    component: NAME.to_string(),
                    key: "label".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            self.label = label.to_string();
        }
        Ok(())
    }

    async fn should_participate(&self, _signature: &Signature) -> Result<bool> {
        Ok(true)
    }

    async fn consume(&self, mut reader: BoxReader, signature: Signature, errors: ErrorSink) {
        match tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
            Ok(bytes) => {
                info!(
                    label = %self.label,
                    path = %signature.path,
                    hash = %signature.content_hash,
                    bytes,
                    "item received"
                );
                self.book.record(LogEntry {
                    path: signature.path,
                    content_hash: signature.content_hash,
                    bytes,
                });
            }
            Err(e) => errors.report(EngineError::Sink {
                backend: NAME.to_string(),
                msg: format!("{}: {e}", signature.path),
            }),
        }
    }

    async fn retrieve(&self, _signature: &Signature) -> Result<BoxReader> {
        Err(EngineError::Unsupported {
            backend: NAME.to_string(),
            operation: "retrieve",
        })
    }
}
