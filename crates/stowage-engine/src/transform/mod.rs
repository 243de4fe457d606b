//! Ordered, reversible chains of streaming byte transforms.
//!
//! Each stage of a pipeline runs as its own task, connected to the next by a pipe. Consumers
//! must read the tail concurrently with the shared error channel.

pub mod compress;

use crate::backend::{BoxReader, ErrorSink};
use crate::definition::{ComponentSpec, Options};
use crate::error::{EngineError, Result};
use crate::pipe::{pipe, PipeWriter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const STAGE_READ_BUFFER: usize = 64 * 1024;

/// Which way a transform runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Encode (backup).
    Forward,
    /// Decode (restore).
    Backward,
}

/// Incremental byte encoder/decoder for one stream.
pub trait StreamCodec: Send {
    /// Feed input, appending any produced bytes to `out`.
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()>;
    /// Flush remaining state at end of input.
    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()>;
}

/// A configured, reversible stream transform.
pub trait Transform: Send + Sync {
    /// Registered name, recorded in signatures.
    fn name(&self) -> &str;

    /// Validate options and fix the direction. Invalid options are configuration errors.
    fn configure(&mut self, options: &Options, direction: Direction) -> Result<()>;

    /// Configured direction.
    fn direction(&self) -> Direction;

    /// Fresh codec for one stream.
    fn codec(&self) -> io::Result<Box<dyn StreamCodec>>;

    /// Start a stage task reading `input` and return the transformed reader.
    fn process(&self, input: BoxReader, errors: ErrorSink, pipe_capacity: usize) -> BoxReader {
        match self.codec() {
            Ok(codec) => spawn_stage(self.name().to_string(), input, codec, errors, pipe_capacity),
            Err(e) => {
                errors.report(EngineError::Stage {
                    stage: self.name().to_string(),
                    msg: e.to_string(),
                });
                let (mut writer, reader) = pipe(1);
                writer.abort();
                Box::pin(reader)
            }
        }
    }
}

/// Constructor producing an unconfigured transform.
pub type TransformFactory = Arc<dyn Fn() -> Box<dyn Transform> + Send + Sync>;

/// Name → constructor lookup for transforms.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    factories: HashMap<String, TransformFactory>,
}

impl TransformRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in transform.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(compress::NAME, || Box::new(compress::Compress::default()));
        registry
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct and configure one transform.
    pub fn build(&self, spec: &ComponentSpec, direction: Direction) -> Result<Arc<dyn Transform>> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| EngineError::UnknownTransform {
                name: spec.name.clone(),
            })?;
        let mut transform = factory();
        transform.configure(&spec.options, direction)?;
        Ok(Arc::from(transform))
    }
}

/// Transforms resolved for one direction, in the order they run.
#[derive(Clone)]
pub struct Chain {
    direction: Direction,
    stages: Vec<Arc<dyn Transform>>,
}

impl Chain {
    /// Resolve `specs` (given in forward order). Backward chains are reversed so the
    /// most recently applied encoding is undone first.
    pub fn build(
        specs: &[ComponentSpec],
        direction: Direction,
        registry: &TransformRegistry,
    ) -> Result<Self> {
        let mut stages = specs
            .iter()
            .map(|spec| registry.build(spec, direction))
            .collect::<Result<Vec<_>>>()?;
        if direction == Direction::Backward {
            stages.reverse();
        }
        Ok(Self { direction, stages })
    }

    /// Chain with no stages.
    pub fn empty(direction: Direction) -> Self {
        Self {
            direction,
            stages: Vec::new(),
        }
    }

    /// Direction of every stage.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Arc<dyn Transform>] {
        &self.stages
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Stage names in forward (encoding) order, as recorded in signatures.
    pub fn applied_names(&self) -> Vec<String> {
        let mut names = self.names();
        if self.direction == Direction::Backward {
            names.reverse();
        }
        names
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// A running transform pipeline.
pub struct Pipeline {
    /// Output of the last stage (or the source when the chain is empty).
    pub tail: BoxReader,
    /// Errors reported by any stage. Closes when every stage task has exited.
    pub errors: mpsc::Receiver<EngineError>,
}

/// Chain `source` through every stage of `chain`, one task per stage.
pub fn pipeline(source: BoxReader, chain: &Chain, pipe_capacity: usize) -> Pipeline {
    let (sink, errors) = ErrorSink::channel(chain.len().max(1));
    let mut reader = source;
    for stage in chain.stages() {
        reader = stage.process(reader, sink.clone(), pipe_capacity);
    }
    drop(sink);
    Pipeline {
        tail: reader,
        errors,
    }
}

fn spawn_stage(
    name: String,
    mut input: BoxReader,
    mut codec: Box<dyn StreamCodec>,
    errors: ErrorSink,
    pipe_capacity: usize,
) -> BoxReader {
    let (mut writer, reader) = pipe(pipe_capacity);
    tokio::spawn(async move {
        let result = run_stage(&mut input, codec.as_mut(), &mut writer).await;
        let result = match result {
            Ok(written) => writer.finish().await.map(|_| written),
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => trace!(stage = %name, written, "stage finished"),
            Err(e) => {
                debug!(stage = %name, error = %e, "stage failed");
                errors.report(EngineError::Stage {
                    stage: name,
                    msg: e.to_string(),
                });
                writer.abort();
            }
        }
    });
    Box::pin(reader)
}

async fn run_stage(
    input: &mut BoxReader,
    codec: &mut dyn StreamCodec,
    writer: &mut PipeWriter,
) -> io::Result<u64> {
    let mut buf = vec![0u8; STAGE_READ_BUFFER];
    let mut out = Vec::new();
    let mut written = 0u64;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        codec.update(&buf[..n], &mut out)?;
        if !out.is_empty() {
            writer.write_all(&out).await?;
            written += out.len() as u64;
            out.clear();
        }
    }
    codec.finish(&mut out)?;
    if !out.is_empty() {
        writer.write_all(&out).await?;
        written += out.len() as u64;
    }
    Ok(written)
}
