//! Bounded producer / worker / consumer pool with cooperative abort.
//!
//! Items go in through `Submitter::add` (blocking when the input buffer is full), `n` workers
//! run them, and outcomes come out of the receiver returned by `start`. The outcome channel
//! closes only after every worker has exited.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A unit of work run by a queue worker.
#[async_trait]
pub trait Work: Send + 'static {
    /// Result forwarded to the consumer.
    type Output: Send + 'static;

    /// Execute the item. Runs to completion even if the queue is aborted meanwhile.
    async fn run(self) -> Self::Output;
}

/// Handle used by producers to enqueue work.
pub struct Submitter<W: Work> {
    tx: mpsc::Sender<W>,
    abort: CancellationToken,
}

impl<W: Work> Clone for Submitter<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            abort: self.abort.clone(),
        }
    }
}

impl<W: Work> Submitter<W> {
    /// Enqueue an item, waiting for room. Fails once the queue is aborted or all workers are gone.
    pub async fn add(&self, item: W) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(EngineError::QueueClosed),
            sent = self.tx.send(item) => sent.map_err(|_| EngineError::QueueClosed),
        }
    }

    /// Release this handle. The input side closes when every submitter is finished.
    pub fn finish(self) {}
}

/// Cloneable handle that aborts a queue.
#[derive(Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Stop workers from taking new items or sending further results.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Check if the queue was aborted.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Bounded worker pool turning a stream of work items into a stream of outputs.
pub struct WorkQueue<W: Work> {
    input_tx: Option<mpsc::Sender<W>>,
    input_rx: Option<mpsc::Receiver<W>>,
    result_capacity: usize,
    abort: CancellationToken,
}

impl<W: Work> WorkQueue<W> {
    /// Create a queue with the given input and result buffer sizes.
    pub fn new(queue_capacity: usize, result_capacity: usize) -> Self {
        Self::with_abort(queue_capacity, result_capacity, CancellationToken::new())
    }

    /// Create a queue whose abort signal is shared with an external token.
    pub fn with_abort(
        queue_capacity: usize,
        result_capacity: usize,
        abort: CancellationToken,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            input_tx: Some(input_tx),
            input_rx: Some(input_rx),
            result_capacity: result_capacity.max(1),
            abort,
        }
    }

    /// A new producer handle, or `None` once `finish` has been called.
    pub fn submitter(&self) -> Option<Submitter<W>> {
        self.input_tx.as_ref().map(|tx| Submitter {
            tx: tx.clone(),
            abort: self.abort.clone(),
        })
    }

    /// Enqueue through the queue's own input handle.
    pub async fn add(&self, item: W) -> Result<()> {
        match self.submitter() {
            Some(submitter) => submitter.add(item).await,
            None => Err(EngineError::QueueClosed),
        }
    }

    /// Launch `workers` concurrent workers and return the outcome receiver.
    ///
    /// Returns `None` if the queue was already started.
    pub fn start(&mut self, workers: usize) -> Option<mpsc::Receiver<W::Output>> {
        let input_rx = Arc::new(Mutex::new(self.input_rx.take()?));
        let (result_tx, result_rx) = mpsc::channel(self.result_capacity);

        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            pool.spawn(worker(id, input_rx.clone(), result_tx.clone(), self.abort.clone()));
        }
        drop(result_tx);

        // Join the pool so worker panics surface in the log; the result channel itself
        // closes when the last worker drops its sender.
        tokio::spawn(async move {
            while let Some(joined) = pool.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "work queue worker panicked");
                }
            }
            trace!("work queue workers joined");
        });

        Some(result_rx)
    }

    /// Close the queue's own input handle; queued items still drain.
    pub fn finish(&mut self) {
        self.input_tx.take();
    }

    /// Stop workers from taking new items or sending further results.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Handle for aborting the queue from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.abort.clone(),
        }
    }
}

async fn worker<W: Work>(
    id: usize,
    input: Arc<Mutex<mpsc::Receiver<W>>>,
    results: mpsc::Sender<W::Output>,
    abort: CancellationToken,
) {
    let mut processed = 0u64;
    loop {
        let next = {
            let mut rx = input.lock().await;
            tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = next else { break };

        let output = item.run().await;
        processed += 1;

        tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            sent = results.send(output) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(worker = id, processed, aborted = abort.is_cancelled(), "worker exiting");
}
