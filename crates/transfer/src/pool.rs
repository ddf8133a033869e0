//! Bounded worker pool over a queue of chunks.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::TransferError;
use crate::metadata::MetadataStore;
use crate::plan::ByteRange;
use crate::retry::RetryPolicy;

/// Default pool size: one less than the available parallelism, at least 1.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Runs a chunk task across a fixed number of workers.
///
/// Each worker pulls the next chunk from a shared queue. The first failing
/// chunk stops the pool: workers finish the chunk they hold and then exit
/// without taking new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Sizes the pool from `configured` (or [`default_workers`]), capped at
    /// the number of pending chunks.
    pub fn new(configured: Option<usize>, pending: usize) -> Self {
        let wanted = configured.unwrap_or_else(default_workers).max(1);
        Self {
            workers: wanted.min(pending.max(1)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Executes `task(worker_id, chunk)` for every chunk.
    ///
    /// Returns the first error any worker produced.
    pub async fn run<F, Fut>(&self, chunks: Vec<ByteRange>, task: F) -> Result<(), TransferError>
    where
        F: Fn(usize, ByteRange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        if chunks.is_empty() {
            return Ok(());
        }
        let queue = Arc::new(Mutex::new(VecDeque::from(chunks)));
        let halted = Arc::new(AtomicBool::new(false));
        let task = Arc::new(task);
        let mut set = JoinSet::new();

        for worker in 0..self.workers {
            let queue = Arc::clone(&queue);
            let halted = Arc::clone(&halted);
            let task = Arc::clone(&task);
            set.spawn(async move {
                loop {
                    if halted.load(Ordering::Acquire) {
                        debug!(worker, "worker stopping after failure elsewhere");
                        return Ok(());
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(range) = next else {
                        return Ok(());
                    };
                    if let Err(e) = task(worker, range).await {
                        halted.store(true, Ordering::Release);
                        return Err(e);
                    }
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(TransferError::Worker(e.to_string())));
            if let Err(e) = outcome {
                halted.store(true, Ordering::Release);
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "additional chunk failure after stop");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Runs one chunk to completion, recording every attempt in `store`.
///
/// `attempt` performs a single transfer of `range` and returns the bytes
/// observed. Transient failures are retried per `policy`; the final failure
/// is returned as [`TransferError::Chunk`] carrying the attempt count and
/// last status code.
pub async fn attempt_chunk<F, Fut>(
    store: &MetadataStore,
    policy: &RetryPolicy,
    worker: usize,
    range: ByteRange,
    mut attempt: F,
) -> Result<u64, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64, TransferError>>,
{
    let mut tries = 0u32;
    loop {
        tries += 1;
        store.begin_attempt(range, worker).await?;
        let err = match attempt().await {
            Ok(bytes) => {
                store.mark_done(range, bytes).await?;
                debug!(start = range.start, end = range.end, worker, bytes, "chunk done");
                return Ok(bytes);
            }
            Err(e) => e,
        };
        store.mark_error(range, &err.to_string()).await?;

        if policy.should_retry(tries, &err) {
            let delay = policy.delay();
            warn!(
                start = range.start,
                end = range.end,
                worker,
                attempt = tries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        let record = store.get(range).await;
        let attempts = record.as_ref().map_or(tries, |r| r.retry_count);
        let status = record
            .and_then(|r| r.last_status_code)
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        error!(
            start = range.start,
            end = range.end,
            worker,
            attempts,
            status = %status,
            error = %err,
            "chunk failed"
        );
        return Err(TransferError::Chunk {
            key: range.key(),
            attempts,
            status,
            source: Box::new(err),
        });
    }
}
