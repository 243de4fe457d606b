//! Storage backends and their name → constructor registry.

pub mod local;
pub mod log;

use crate::definition::{ComponentSpec, Options};
use crate::error::{EngineError, Result};
use crate::signature::Signature;
use async_trait::async_trait;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::debug;

/// Owned, type-erased byte stream.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Shared error channel handed to transform stages and sink tasks.
///
/// Reporting never blocks: when the channel already holds as many errors as it has room for,
/// further reports are dropped, since one error is enough to fail the item.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<EngineError>,
}

impl ErrorSink {
    /// Create a sink and its receiver with room for `capacity` pending errors.
    pub fn channel(capacity: usize) -> (ErrorSink, mpsc::Receiver<EngineError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ErrorSink { tx }, rx)
    }

    /// Report an error without waiting.
    pub fn report(&self, err: EngineError) {
        if let Err(e) = self.tx.try_send(err) {
            debug!(error = %e, "error sink full or closed, dropping report");
        }
    }
}

/// A pluggable storage destination and/or source.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// Apply options. Invalid options are configuration errors.
    fn configure(&mut self, options: &Options) -> Result<()>;

    /// Whether this backend wants to store the item.
    async fn should_participate(&self, signature: &Signature) -> Result<bool>;

    /// Consume `reader` to EOF, reporting failures to `errors`.
    async fn consume(&self, reader: BoxReader, signature: Signature, errors: ErrorSink);

    /// Open the stored bytes for a signature.
    async fn retrieve(&self, signature: &Signature) -> Result<BoxReader>;
}

/// Constructor producing an unconfigured backend.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn Backend> + Send + Sync>;

/// Name → constructor lookup for backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `local` and `log` backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(local::NAME, || Box::new(local::LocalBackend::default()));
        registry.register(log::NAME, || Box::new(log::LogBackend::default()));
        registry
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Backend> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct and configure one backend.
    pub fn build(&self, spec: &ComponentSpec) -> Result<Arc<dyn Backend>> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| EngineError::UnknownBackend {
                name: spec.name.clone(),
            })?;
        let mut backend = factory();
        backend.configure(&spec.options)?;
        Ok(Arc::from(backend))
    }

    /// Construct every backend in `specs`, failing on the first error.
    pub fn build_all(&self, specs: &[ComponentSpec]) -> Result<Vec<Arc<dyn Backend>>> {
        specs.iter().map(|spec| self.build(spec)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Backend with scripted participation that records consumed bytes.
    pub(crate) struct Scripted {
        pub(crate) name: String,
        pub(crate) participate: std::result::Result<bool, String>,
        pub(crate) received: Arc<std::sync::Mutex<Vec<u8>>>,
        pub(crate) consumed: Arc<AtomicUsize>,
        /// Consume calls, counted on entry.
        pub(crate) started: Arc<AtomicUsize>,
        pub(crate) retrieved: Arc<AtomicUsize>,
        pub(crate) fail_consume: bool,
    }

    impl Scripted {
        pub(crate) fn new(name: &str, participate: std::result::Result<bool, String>) -> Self {
            Self {
                name: name.to_string(),
                participate,
                received: Arc::new(std::sync::Mutex::new(Vec::new())),
                consumed: Arc::new(AtomicUsize::new(0)),
                started: Arc::new(AtomicUsize::new(0)),
                retrieved: Arc::new(AtomicUsize::new(0)),
                fail_consume: false,
            }
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        fn name(&self) -> &str {
            &self.name
        }
        fn configure(&mut self, _options: &Options) -> Result<()> {
            Ok(())
        }
        async fn should_participate(&self, _signature: &Signature) -> Result<bool> {
            self.participate
                .clone()
                .map_err(|msg| EngineError::Participation {
                    backend: self.name.clone(),
                    msg,
                })
        }
        async fn consume(&self, mut reader: BoxReader, _signature: Signature, errors: ErrorSink) {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail_consume {
                errors.report(EngineError::Sink {
                    backend: self.name.clone(),
                    msg: "refusing bytes".into(),
                });
                return;
            }
            let mut buf = Vec::new();
            match reader.read_to_end(&mut buf).await {
                Ok(_) => {
                    self.received.lock().unwrap().extend_from_slice(&buf);
                    self.consumed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => errors.report(EngineError::Sink {
                    backend: self.name.clone(),
                    msg: e.to_string(),
                }),
            }
        }
        async fn retrieve(&self, _signature: &Signature) -> Result<BoxReader> {
            self.retrieved.fetch_add(1, Ordering::SeqCst);
            let data = self.received.lock().unwrap().clone();
            Ok(Box::pin(std::io::Cursor::new(data)))
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["local".to_string(), "log".to_string()]);
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BackendRegistry::with_builtins();
        let err = registry.build(&ComponentSpec::named("s3")).err().unwrap();
        assert!(matches!(err, EngineError::UnknownBackend { .. }));
    }

    #[test]
    fn test_configure_error_propagates() {
        let registry = BackendRegistry::with_builtins();
        let err = registry.build(&ComponentSpec::named("local")).err().unwrap();
        assert!(matches!(err, EngineError::InvalidOption { .. }));
    }

    #[tokio::test]
    async fn test_error_sink_never_blocks() {
        let (sink, mut rx) = ErrorSink::channel(1);
        for i in 0..5 {
            sink.report(EngineError::Sink {
                backend: "b".into(),
                msg: format!("{i}"),
            });
        }
        drop(sink);
        let mut n = 0;
        while rx.recv().await.is_some() {
            n += 1;
        }
        assert_eq!(n, 1);
    }
}
