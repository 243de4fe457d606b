#![warn(missing_docs)]

//! Stowage job execution engine: discovers work, runs it through a bounded worker pool,
//! streams each item through an ordered transform chain and fans the bytes out to storage backends.
//!
//! Backup: walk, hash (BLAKE3), participation, forward transforms, fan-out to backends.
//! Restore: retrieve, reversed backward transforms, hash check, fan-out to backends.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod definition;
pub mod discovery;
pub mod error;
pub mod fanout;
pub mod job;
pub mod manager;
pub mod notify;
pub mod pipe;
pub mod processor;
pub mod queue;
pub mod signature;
pub mod transform;

pub use backend::local::LocalBackend;
pub use backend::log::{LogBackend, LogBook, LogEntry};
pub use backend::{Backend, BackendRegistry, BoxReader, ErrorSink};
pub use cancel::CancelSignal;
pub use config::EngineConfig;
pub use definition::{ComponentSpec, JobDefinition, JobKind, Options, PathSpec};
pub use discovery::DiscoveryReport;
pub use error::{EngineError, ErrorKind, OutcomeError, Result};
pub use fanout::{FanOut, FanOutWriter, SinkErrors};
pub use job::{Job, JobId, JobMeta, JobState, JobStatus, ManagedJob, Tally};
pub use manager::{JobHandle, JobRegistry, Manager};
pub use notify::{ChannelNotifier, Event, Notifier, NullNotifier, TracingNotifier};
pub use processor::{FileTask, Outcome, OutcomeState, Plan, Unit};
pub use queue::{AbortHandle, Submitter, Work, WorkQueue};
pub use signature::{ContentHash, Signature};
pub use transform::{Chain, Direction, Pipeline, StreamCodec, Transform, TransformRegistry};
