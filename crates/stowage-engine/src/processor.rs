//! Per-item worker logic: hash, decide participation, stream through transforms into sinks.

use crate::backend::{Backend, BackendRegistry, BoxReader};
use crate::config::EngineConfig;
use crate::definition::{JobDefinition, JobKind};
use crate::error::{EngineError, OutcomeError, Result};
use crate::fanout::{FanOut, FanOutWriter};
use crate::queue::Work;
use crate::signature::{hash_file, ContentHash, Signature};
use crate::transform::{pipeline, Chain, Direction, Pipeline, TransformRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

/// Resolved components shared by every item of one job.
pub struct Plan {
    /// Backup or restore.
    pub kind: JobKind,
    /// Transforms in execution order (backward chains are already reversed).
    pub chain: Chain,
    /// Destination backends.
    pub to: Vec<Arc<dyn Backend>>,
    /// Restore source.
    pub from: Option<Arc<dyn Backend>>,
    /// Buffer size for every pipe.
    pub pipe_capacity: usize,
    /// Read buffer for the tail → fan-out copy.
    pub copy_buffer: usize,
}

impl Plan {
    /// Resolve every named component of `definition`. Any failure here is a configuration error.
    pub fn build(
        kind: JobKind,
        definition: &JobDefinition,
        config: &EngineConfig,
        backends: &BackendRegistry,
        transforms: &TransformRegistry,
    ) -> Result<Self> {
        config.validate()?;
        definition.validate(kind)?;

        let direction = match kind {
            JobKind::Backup => Direction::Forward,
            JobKind::Restore => Direction::Backward,
        };
        let chain = Chain::build(&definition.modifications, direction, transforms)?;
        let to = backends.build_all(&definition.to)?;
        let from = match (kind, &definition.from) {
            (JobKind::Restore, Some(spec)) => Some(backends.build(spec)?),
            _ => None,
        };

        Ok(Self {
            kind,
            chain,
            to,
            from,
            pipe_capacity: config.pipe_capacity,
            copy_buffer: config.copy_buffer,
        })
    }
}

/// What a task operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A source file to back up.
    Backup(PathBuf),
    /// A stored item to restore.
    Restore(Signature),
}

/// One work item bound to its job's plan.
pub struct FileTask {
    /// Item to process.
    pub unit: Unit,
    /// Components to process it with.
    pub plan: Arc<Plan>,
}

impl FileTask {
    /// Bind a unit to a plan.
    pub fn new(unit: Unit, plan: Arc<Plan>) -> Self {
        Self { unit, plan }
    }
}

#[async_trait]
impl Work for FileTask {
    type Output = Outcome;

    async fn run(self) -> Outcome {
        match self.unit {
            Unit::Backup(path) => backup(&self.plan, path).await,
            Unit::Restore(signature) => restore(&self.plan, signature).await,
        }
    }
}

/// Final state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    /// Every participating sink received the whole stream.
    Complete,
    /// No sink wanted the item.
    Skipped,
    /// Something failed; see the attached error.
    Errors,
}

/// Per-item result, produced exactly once per work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Identity of the item.
    pub signature: Signature,
    /// How processing ended.
    pub state: OutcomeState,
    /// Present iff `state` is `Errors`.
    pub error: Option<OutcomeError>,
}

impl Outcome {
    /// Successful outcome.
    pub fn complete(signature: Signature) -> Self {
        Self {
            signature,
            state: OutcomeState::Complete,
            error: None,
        }
    }

    /// Nothing to do.
    pub fn skipped(signature: Signature) -> Self {
        Self {
            signature,
            state: OutcomeState::Skipped,
            error: None,
        }
    }

    /// Failed outcome carrying the error.
    pub fn failed(signature: Signature, err: EngineError) -> Self {
        Self {
            signature,
            state: OutcomeState::Errors,
            error: Some(OutcomeError::from(err)),
        }
    }
}

/// Back up one file.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn backup(plan: &Plan, path: PathBuf) -> Outcome {
    let applied = plan.chain.applied_names();
    let display = path.to_string_lossy().into_owned();

    let hash = match hash_file(&path).await {
        Ok(hash) => hash,
        Err(e) => {
            let signature = Signature::new(display, ContentHash::default(), applied);
            return Outcome::failed(signature, e);
        }
    };
    let signature = Signature::new(display, hash, applied);

    let fanout = match FanOut::open(&signature, &plan.to, plan.pipe_capacity).await {
        Ok(Some(fanout)) => fanout,
        Ok(None) => {
            debug!("no backend wants item");
            return Outcome::skipped(signature);
        }
        Err(e) => return Outcome::failed(signature, e),
    };

    let source = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            fanout.abort().await;
            return Outcome::failed(signature, EngineError::io("open source", &path, e));
        }
    };

    match copy_race(Box::pin(source), plan, fanout, None).await {
        Ok(bytes) => {
            debug!(bytes, "item stored");
            Outcome::complete(signature)
        }
        Err(e) => Outcome::failed(signature, e),
    }
}

/// Restore one stored item from the plan's source into its destinations.
#[instrument(skip_all, fields(path = %signature.path))]
pub async fn restore(plan: &Plan, signature: Signature) -> Outcome {
    let applied = plan.chain.applied_names();
    if applied != signature.applied_transforms {
        let msg = format!(
            "item was stored with transforms {:?} but the job declares {:?}",
            signature.applied_transforms, applied
        );
        return Outcome::failed(signature, EngineError::InvalidDefinition(msg));
    }
    let Some(from) = plan.from.as_ref() else {
        return Outcome::failed(
            signature,
            EngineError::InvalidDefinition("restore requires a `from` backend".into()),
        );
    };

    let fanout = match FanOut::open(&signature, &plan.to, plan.pipe_capacity).await {
        Ok(Some(fanout)) => fanout,
        Ok(None) => {
            debug!("no backend wants item");
            return Outcome::skipped(signature);
        }
        Err(e) => return Outcome::failed(signature, e),
    };

    let source = match from.retrieve(&signature).await {
        Ok(reader) => reader,
        Err(e) => {
            fanout.abort().await;
            return Outcome::failed(signature, e);
        }
    };

    match copy_race(source, plan, fanout, Some(&signature.content_hash)).await {
        Ok(bytes) => {
            debug!(bytes, "item restored");
            Outcome::complete(signature)
        }
        Err(e) => Outcome::failed(signature, e),
    }
}

/// Copy `source` through the plan's chain into the fan-out, racing the copy against the
/// stage and sink error channels. Returns once every stage and sink task has exited.
///
/// With `expected` set, the chain output is hashed and the sinks only see a clean end of
/// stream if it matches; otherwise they are aborted and the result is `Integrity`.
pub async fn copy_race(
    source: BoxReader,
    plan: &Plan,
    fanout: FanOut,
    expected: Option<&ContentHash>,
) -> Result<u64> {
    let Pipeline {
        mut tail,
        errors: mut stage_errors,
    } = pipeline(source, &plan.chain, plan.pipe_capacity);
    let (mut writer, mut sink_errors) = fanout.into_parts();

    let verify = expected.is_some();
    let copied = {
        let copy = copy_into(&mut tail, &mut writer, plan.copy_buffer, verify);
        tokio::pin!(copy);
        tokio::select! {
            res = &mut copy => res,
            Some(err) = stage_errors.recv() => Err(err),
            Some(err) = sink_errors.recv() => Err(err),
        }
    };
    let copied = copied.and_then(|(bytes, actual)| match (expected, actual) {
        (Some(expected), Some(actual)) if actual != *expected => Err(EngineError::Integrity {
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        }),
        _ => Ok(bytes),
    });

    match copied {
        Ok(bytes) => {
            let finished = writer.finish().await;
            drop(tail);
            let stage_result = match stage_errors.recv().await {
                Some(err) => Err(err),
                None => Ok(()),
            };
            let sink_result = sink_errors.settle().await;
            finished.and(stage_result).and(sink_result).map(|_| bytes)
        }
        Err(err) => {
            writer.abort();
            drop(tail);
            // A broken tail is usually the echo of a stage failure; report the stage instead.
            let err = match (err, stage_errors.try_recv()) {
                (EngineError::Stream(_), Ok(stage_err)) => stage_err,
                (err, _) => err,
            };
            let _ = sink_errors.settle().await;
            Err(err)
        }
    }
}

async fn copy_into(
    reader: &mut BoxReader,
    writer: &mut FanOutWriter,
    buffer: usize,
    hash: bool,
) -> Result<(u64, Option<ContentHash>)> {
    let mut buf = vec![0u8; buffer.max(1)];
    let mut hasher = hash.then(blake3::Hasher::new);
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let digest = hasher.map(|h| ContentHash(*h.finalize().as_bytes()));
            return Ok((total, digest));
        }
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..n]);
        }
        writer.write(&buf[..n]).await?;
        total += n as u64;
    }
}
