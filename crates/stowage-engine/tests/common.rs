//! Shared fixtures for the end-to-end job scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_engine::{
    Backend, BackendRegistry, BoxReader, ChannelNotifier, EngineConfig, EngineError, ErrorSink,
    Event, JobId, JobStatus, LogBackend, LogBook, Manager, Options, Outcome, Result, Signature,
    TransformRegistry,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Backend whose participation check always fails.
pub struct Unavailable;

#[async_trait]
impl Backend for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn configure(&mut self, _options: &Options) -> Result<()> {
        Ok(())
    }

    async fn should_participate(&self, _signature: &Signature) -> Result<bool> {
        Err(EngineError::Participation {
            backend: "unavailable".to_string(),
            msg: "catalog unreachable".to_string(),
        })
    }

    async fn consume(&self, _reader: BoxReader, _signature: Signature, _errors: ErrorSink) {}

    async fn retrieve(&self, _signature: &Signature) -> Result<BoxReader> {
        Err(EngineError::Unsupported {
            backend: "unavailable".to_string(),
            operation: "retrieve",
        })
    }
}

/// A manager wired to a shared log book and an event channel.
pub struct Harness {
    pub manager: Manager,
    pub events: UnboundedReceiver<Event>,
    pub book: LogBook,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let book = LogBook::new();
        let shared = book.clone();
        let mut backends = BackendRegistry::with_builtins();
        backends.register("log", move || Box::new(LogBackend::with_book(shared.clone())));
        backends.register("unavailable", || Box::new(Unavailable));

        let (notifier, events) = ChannelNotifier::new();
        let manager = Manager::new(
            config,
            backends,
            TransformRegistry::with_builtins(),
            Arc::new(notifier),
        )
        .expect("valid engine config");
        Self {
            manager,
            events,
            book,
        }
    }

    /// Collect per-file outcomes for `job_id` until its completion event arrives.
    pub async fn outcomes_until_finished(&mut self, job_id: &JobId) -> (Vec<Outcome>, JobStatus) {
        let mut outcomes = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                Event::FileResult { job_id: id, outcome } if &id == job_id => {
                    outcomes.push(outcome)
                }
                Event::JobFinished { job_id: id, status } if &id == job_id => {
                    return (outcomes, status)
                }
                _ => {}
            }
        }
        panic!("event channel closed before job {job_id} finished");
    }
}

/// Engine config with a single worker.
pub fn single_worker() -> EngineConfig {
    EngineConfig {
        workers: 1,
        ..Default::default()
    }
}

/// Write `count` files of distinct content below `root`, spread over a few subdirectories.
pub fn write_tree(root: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let dir = root.join(format!("dir{}", i % 3));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(format!("file{i:03}.dat"));
            let body = format!("file number {i}\n").repeat(i + 1);
            std::fs::write(&path, body).unwrap();
            path
        })
        .collect()
}

/// Regular files directly inside `dir`.
pub fn stored_objects(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect()
}
