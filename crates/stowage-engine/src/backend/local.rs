//! Local directory store keyed by signature.

use super::{Backend, BoxReader, ErrorSink};
use crate::definition::Options;
use crate::error::{EngineError, Result};
use crate::signature::Signature;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Registered name of the local backend.
pub const NAME: &str = "local";

const PARTIAL_SUFFIX: &str = "partial";

/// Stores each item at `<path>/<storage key>`.
///
/// Writes go to `<key>.partial` and are renamed into place only after the stream ends
/// cleanly, so an interrupted item is never mistaken for a stored one.
#[derive(Debug, Default, Clone)]
pub struct LocalBackend {
    root: Option<PathBuf>,
}

impl LocalBackend {
    /// Backend rooted at `root`, creating it if needed.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let mut backend = Self::default();
        let root = root.into();
        backend.configure(&Options::new().with("path", root.to_string_lossy()))?;
        Ok(backend)
    }

    fn root(&self) -> Result<&Path> {
        self.root
            .as_deref()
            .ok_or_else(|| EngineError::InvalidOption {
                component: NAME.to_string(),
                key: "path".to_string(),
                reason: "backend not configured".to_string(),
            })
    }

    /// Final location of a signature's bytes.
    pub fn object_path(&self, signature: &Signature) -> Result<PathBuf> {
        Ok(self.root()?.join(signature.storage_key()))
    }

    fn sink_error(&self, msg: impl Into<String>) -> EngineError {
        EngineError::Sink {
            backend: NAME.to_string(),
            msg: msg.into(),
        }
    }

    async fn store(&self, reader: &mut BoxReader, signature: &Signature) -> Result<u64> {
        let target = self.object_path(signature)?;
        let partial = target.with_extension(PARTIAL_SUFFIX);

        let file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| EngineError::io("create partial object", &partial, e))?;
        let result = match self.write_partial(reader, file, &partial, signature).await {
            Ok(copied) => tokio::fs::rename(&partial, &target)
                .await
                .map(|_| copied)
                .map_err(|e| EngineError::io("rename object", &target, e)),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                debug!(partial = %partial.display(), error = %e, "partial object not removed");
            }
        }
        result
    }

    async fn write_partial(
        &self,
        reader: &mut BoxReader,
        mut file: tokio::fs::File,
        partial: &Path,
        signature: &Signature,
    ) -> Result<u64> {
        let copied = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| self.sink_error(format!("stream for {}: {e}", signature.path)))?;
        file.flush()
            .await
            .map_err(|e| EngineError::io("flush object", partial, e))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::io("sync object", partial, e))?;
        Ok(copied)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, options: &Options) -> Result<()> {
        let root = PathBuf::from(options.require(NAME, "path")?);
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::io("create store directory", &root, e))?;
        self.root = Some(root);
        Ok(())
    }

    async fn should_participate(&self, signature: &Signature) -> Result<bool> {
        let target = self.object_path(signature)?;
        let stored = tokio::fs::try_exists(&target)
            .await
            .map_err(|e| EngineError::io("stat object", &target, e))?;
        Ok(!stored)
    }

    async fn consume(&self, mut reader: BoxReader, signature: Signature, errors: ErrorSink) {
        match self.store(&mut reader, &signature).await {
            Ok(bytes) => debug!(path = %signature.path, bytes, "local object stored"),
            Err(e) => {
                warn!(path = %signature.path, error = %e, "local store failed");
                errors.report(e);
            }
        }
    }

    async fn retrieve(&self, signature: &Signature) -> Result<BoxReader> {
        let target = self.object_path(signature)?;
        let file = tokio::fs::File::open(&target).await.map_err(|e| {
            self.sink_error(format!(
                "no stored object for {} at {}: {e}",
                signature.path,
                target.display()
            ))
        })?;
        Ok(Box::pin(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ContentHash;
    use tokio::io::AsyncReadExt;

    fn sig(path: &str) -> Signature {
        let hash = ContentHash(*blake3::hash(path.as_bytes()).as_bytes());
        Signature::new(path, hash, vec![])
    }

    #[tokio::test]
    async fn test_store_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::at(dir.path()).unwrap();
        let s = sig("/data/a.txt");

        assert!(backend.should_participate(&s).await.unwrap());

        let (sink, mut errors) = ErrorSink::channel(1);
        backend
            .consume(Box::pin(std::io::Cursor::new(b"payload".to_vec())), s.clone(), sink)
            .await;
        assert!(errors.recv().await.is_none());

        assert!(!backend.should_participate(&s).await.unwrap());
        let mut out = Vec::new();
        backend
            .retrieve(&s)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_truncated_stream_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::at(dir.path()).unwrap();
        let s = sig("/data/b.txt");

        let (mut writer, reader) = crate::pipe::pipe(16);
        writer.write_all(b"half").await.unwrap();
        writer.abort();

        let (sink, mut errors) = ErrorSink::channel(1);
        backend.consume(Box::pin(reader), s.clone(), sink).await;
        assert!(matches!(errors.recv().await, Some(EngineError::Sink { .. })));
        assert!(backend.should_participate(&s).await.unwrap());
        assert!(!backend.object_path(&s).unwrap().with_extension("partial").exists());
    }

    #[tokio::test]
    async fn test_retrieve_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::at(dir.path()).unwrap();
        assert!(matches!(
            backend.retrieve(&sig("/nope")).await,
            Err(EngineError::Sink { .. })
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_backend_errors() {
        let backend = LocalBackend::default();
        assert!(backend.should_participate(&sig("/x")).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_commit_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::at(dir.path()).unwrap();
        let s = sig("/blocked");
        let target = backend.object_path(&s).unwrap();
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("occupant"), b"x").unwrap();

        let mut reader: BoxReader = Box::pin(std::io::Cursor::new(b"payload".to_vec()));
        let err = backend.store(&mut reader, &s).await.unwrap_err();
        assert!(matches!(err, EngineError::Io { operation: "rename object", .. }));
        assert!(!target.with_extension(PARTIAL_SUFFIX).exists());
        assert!(target.join("occupant").exists());
    }
}
