//! Multiplexes one byte stream to every backend that wants the item.
//!
//! Each participating backend gets its own pipe and consume task. Writers are closed on every
//! exit path: `finish` marks a clean EOF, `abort` (or drop) makes each sink see a truncated
//! stream and discard what it received.

use crate::backend::{Backend, ErrorSink};
use crate::error::{EngineError, Result};
use crate::pipe::{pipe, PipeWriter};
use crate::signature::Signature;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A fan-out over the participating subset of backends.
pub struct FanOut {
    writer: FanOutWriter,
    errors: SinkErrors,
}

impl FanOut {
    /// Ask every sink whether it wants `signature` and start a consume task for each that does.
    ///
    /// A failing participation check aborts construction before any task starts.
    /// Returns `Ok(None)` when no sink participates, so the caller never opens the source.
    pub async fn open(
        signature: &Signature,
        sinks: &[Arc<dyn Backend>],
        pipe_capacity: usize,
    ) -> Result<Option<FanOut>> {
        let mut participants = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let wants = sink
                .should_participate(signature)
                .await
                .map_err(|e| match e {
                    p @ EngineError::Participation { .. } => p,
                    other => EngineError::Participation {
                        backend: sink.name().to_string(),
                        msg: other.to_string(),
                    },
                })?;
            if wants {
                participants.push(sink.clone());
            } else {
                trace!(backend = sink.name(), path = %signature.path, "backend declined item");
            }
        }
        if participants.is_empty() {
            return Ok(None);
        }

        let (sink_errors, rx) = ErrorSink::channel(participants.len());
        let mut pipes = Vec::with_capacity(participants.len());
        let mut tasks = Vec::with_capacity(participants.len());
        for sink in participants {
            let name = sink.name().to_string();
            let (writer, reader) = pipe(pipe_capacity);
            let signature = signature.clone();
            let errors = sink_errors.clone();
            let task = tokio::spawn(async move {
                sink.consume(Box::pin(reader), signature, errors).await;
            });
            pipes.push((name.clone(), writer));
            tasks.push((name, task));
        }
        debug!(path = %signature.path, sinks = pipes.len(), "fan-out opened");

        Ok(Some(FanOut {
            writer: FanOutWriter { pipes },
            errors: SinkErrors { rx, tasks },
        }))
    }

    /// Names of the participating backends.
    pub fn participants(&self) -> Vec<String> {
        self.writer.pipes.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Split into the writing half and the error half.
    pub fn into_parts(self) -> (FanOutWriter, SinkErrors) {
        (self.writer, self.errors)
    }

    /// Close every writer without EOF and wait for the sinks to exit.
    pub async fn abort(self) {
        let (mut writer, errors) = self.into_parts();
        writer.abort();
        let _ = errors.settle().await;
    }
}

/// Write end of a fan-out.
pub struct FanOutWriter {
    pipes: Vec<(String, PipeWriter)>,
}

impl FanOutWriter {
    /// Write `buf` to every sink. Fails if any sink's pipe rejects the bytes.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        for (name, pipe) in &mut self.pipes {
            pipe.write_all(buf).await.map_err(|e| EngineError::Sink {
                backend: name.clone(),
                msg: format!("write: {e}"),
            })?;
        }
        Ok(())
    }

    /// Signal a clean EOF to every sink. Every writer is closed even if one fails.
    pub async fn finish(&mut self) -> Result<()> {
        let mut first = None;
        for (name, pipe) in &mut self.pipes {
            if let Err(e) = pipe.finish().await {
                first.get_or_insert(EngineError::Sink {
                    backend: name.clone(),
                    msg: format!("close: {e}"),
                });
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Close every writer without EOF.
    pub fn abort(&mut self) {
        for (_, pipe) in &mut self.pipes {
            pipe.abort();
        }
    }
}

/// Error half of a fan-out: the shared sink error channel plus the consume tasks.
pub struct SinkErrors {
    rx: mpsc::Receiver<EngineError>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl SinkErrors {
    /// Next reported sink error. `None` once every consume task has exited.
    pub async fn recv(&mut self) -> Option<EngineError> {
        self.rx.recv().await
    }

    /// Wait for every consume task to exit and return the first reported error.
    pub async fn settle(mut self) -> Result<()> {
        let mut first = None;
        while let Some(err) = self.rx.recv().await {
            first.get_or_insert(err);
        }
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                first.get_or_insert(EngineError::Sink {
                    backend: name,
                    msg: format!("consume task failed: {e}"),
                });
            }
        }
        first.map_or(Ok(()), Err)
    }
}
