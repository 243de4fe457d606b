//! In-memory duplex pipe connecting one producer task to one consumer task.
//!
//! The write side is closed exactly once: either `finish()` (clean EOF) or `abort()`/drop
//! (the reader observes `UnexpectedEof` instead of a short stream that looks complete).

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};

/// Create a connected pipe with `capacity` bytes of buffering.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (w, r) = tokio::io::duplex(capacity);
    let finished = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            inner: Some(w),
            finished: finished.clone(),
        },
        PipeReader { inner: r, finished },
    )
}

/// Producer end of a pipe.
pub struct PipeWriter {
    inner: Option<DuplexStream>,
    finished: Arc<AtomicBool>,
}

impl PipeWriter {
    /// Write the whole buffer, waiting for the consumer when the pipe is full.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(stream) => stream.write_all(buf).await,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed")),
        }
    }

    /// Close the pipe with a clean EOF. Later calls are no-ops.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut stream) = self.inner.take() {
            self.finished.store(true, Ordering::Release);
            stream.shutdown().await?;
        }
        Ok(())
    }

    /// Close the pipe without EOF; the reader fails on its next empty read.
    pub fn abort(&mut self) {
        self.inner.take();
    }

    /// True once `finish` or `abort` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// Consumer end of a pipe.
pub struct PipeReader {
    inner: DuplexStream,
    finished: Arc<AtomicBool>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let at_eof = buf.filled().len() == before && buf.remaining() > 0;
        if at_eof && !this.finished.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe writer closed before finishing",
            )));
        }
        Poll::Ready(Ok(()))
    }
}
