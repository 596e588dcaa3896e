// Copyright 2025 Firegate Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Batched write coordinator.
//!
//! [`BulkWriter`] accepts any number of writes and groups them into batches
//! of at most `max_batch_size` operations. It guarantees that:
//!
//! - a batch never contains two writes to the same document
//! - two batches touching the same document are never in flight together
//! - batches are dispatched strictly in queue order; the first batch that
//!   cannot go yet (not ready, blocked by an in-flight document, or
//!   throttled) holds back everything behind it
//!
//! Each write returns a [`PendingWrite`] that resolves with that write's own
//! result. A failed write never fails its siblings.
//!
//! # Batch lifecycle
//!
//! ```text
//! Open --(full | flush)--> ReadyToSend --(dispatch)--> in flight --> resolved
//! ```
//!
//! Dispatched batches leave the queue immediately; the queue only holds
//! batches that have not been sent yet. Until its commit resolves, a
//! dispatched batch stays tracked so that [`BulkWriter::flush`] waits for it.

use crate::rate_limiter::{RateLimiter, ThrottlingConfig};
use crate::write_batch::{Committer, RpcCommitter, Write, WriteBatch};
use firegate_client::{Channel, RpcFacade};
use firegate_common::{DocumentRef, FiregateError, Result, RpcStatus, WriteResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Maximum number of writes in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// BulkWriter configuration.
///
/// # Default Configuration
///
/// - `max_batch_size`: 500
/// - `throttling`: enabled, 500 initial / 10000 maximum ops per second
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BulkWriterOptions {
    pub max_batch_size: usize,
    pub throttling: ThrottlingConfig,
}

impl Default for BulkWriterOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            throttling: ThrottlingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    /// Accepts new writes
    Open,
    /// Full or flushed; waits for dispatch
    ReadyToSend,
}

struct BulkCommitBatch {
    id: u64,
    state: BatchState,
    refs: HashSet<DocumentRef>,
    /// Result senders in operation order
    results: Vec<oneshot::Sender<Result<WriteResult>>>,
    batch: WriteBatch,
    /// Flips to `true` once every result has been resolved
    done: watch::Sender<bool>,
}

impl BulkCommitBatch {
    fn op_count(&self) -> usize {
        self.batch.op_count()
    }
}

struct WriterState {
    /// Batches not yet dispatched, oldest first
    batch_queue: VecDeque<BulkCommitBatch>,
    /// Documents of dispatched but unresolved batches
    refs_in_flight: HashSet<DocumentRef>,
    /// Completion signals of dispatched but unresolved batches, by batch id
    batches_in_flight: HashMap<u64, watch::Receiver<bool>>,
    next_batch_id: u64,
    rate_limiter: Option<RateLimiter>,
    /// A throttled dispatch attempt is already scheduled
    retry_scheduled: bool,
    closed: bool,
}

struct Inner {
    options: BulkWriterOptions,
    committer: Arc<dyn Committer>,
    state: Mutex<WriterState>,
}

/// Resolves with the result of one write.
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<WriteResult>>,
}

impl Future for PendingWrite {
    type Output = Result<WriteResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FiregateError::Internal(
                "write was dropped before it completed".to_string(),
            ))),
        }
    }
}

/// Batched, per-document ordered write coordinator.
///
/// Write methods enqueue synchronously and must be called from within a
/// tokio runtime, since dispatch spawns the commit tasks.
///
/// # Example
///
/// ```rust,no_run
/// use firegate_bulk::{BulkWriter, BulkWriterOptions};
/// use firegate_client::{HttpChannel, HttpChannelConfig, RpcConfig, RpcFacade};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> firegate_common::Result<()> {
/// let facade = Arc::new(RpcFacade::new(RpcConfig::default(), || {
///     Ok(Arc::new(HttpChannel::new(HttpChannelConfig::new("http://127.0.0.1:8080"))))
/// }));
/// let writer = BulkWriter::with_facade(facade, BulkWriterOptions::default());
///
/// let result = writer.set("users/alice", json!({"age": 30}))?;
/// writer.close().await;
/// println!("written at {:?}", result.await?.write_time);
/// # Ok(())
/// # }
/// ```
pub struct BulkWriter {
    inner: Arc<Inner>,
}

impl BulkWriter {
    /// Creates a writer committing through `committer`.
    ///
    /// With throttling enabled, `max_batch_size` is capped at the initial
    /// operations per second so that a full batch always fits the bucket.
    pub fn new(committer: Arc<dyn Committer>, options: BulkWriterOptions) -> Self {
        let rate_limiter = RateLimiter::from_config(&options.throttling, Instant::now());
        let mut max_batch_size = options.max_batch_size.max(1);
        if let Some(limiter) = &rate_limiter {
            let capacity = limiter.initial_capacity() as usize;
            if capacity < max_batch_size {
                debug!(
                    max_batch_size,
                    capacity, "Capping batch size at the initial rate limit"
                );
                max_batch_size = capacity.max(1);
            }
        }
        let options = BulkWriterOptions {
            max_batch_size,
            ..options
        };
        Self {
            inner: Arc::new(Inner {
                options,
                committer,
                state: Mutex::new(WriterState {
                    batch_queue: VecDeque::new(),
                    refs_in_flight: HashSet::new(),
                    batches_in_flight: HashMap::new(),
                    next_batch_id: 0,
                    rate_limiter,
                    retry_scheduled: false,
                    closed: false,
                }),
            }),
        }
    }

    /// Commits through `batchWrite` on `facade`.
    pub fn with_facade<C: Channel>(facade: Arc<RpcFacade<C>>, options: BulkWriterOptions) -> Self {
        Self::new(Arc::new(RpcCommitter::new(facade)), options)
    }

    pub fn options(&self) -> &BulkWriterOptions {
        &self.inner.options
    }

    pub fn create(&self, document: impl Into<DocumentRef>, fields: Value) -> Result<PendingWrite> {
        self.enqueue(Write::Create {
            document: document.into(),
            fields,
        })
    }

    pub fn set(&self, document: impl Into<DocumentRef>, fields: Value) -> Result<PendingWrite> {
        self.enqueue(Write::Set {
            document: document.into(),
            fields,
            merge: false,
        })
    }

    pub fn set_merge(&self, document: impl Into<DocumentRef>, fields: Value) -> Result<PendingWrite> {
        self.enqueue(Write::Set {
            document: document.into(),
            fields,
            merge: true,
        })
    }

    pub fn update(&self, document: impl Into<DocumentRef>, fields: Value) -> Result<PendingWrite> {
        self.enqueue(Write::Update {
            document: document.into(),
            fields,
        })
    }

    pub fn delete(&self, document: impl Into<DocumentRef>) -> Result<PendingWrite> {
        self.enqueue(Write::Delete {
            document: document.into(),
        })
    }

    /// Sends every queued batch and waits until all of them, and every batch
    /// already in flight, are resolved.
    ///
    /// Writes enqueued after this call are not waited on.
    pub async fn flush(&self) {
        let waiters: Vec<watch::Receiver<bool>> = {
            let mut state = self.inner.lock_state();
            let mut waiters: Vec<_> = state.batches_in_flight.values().cloned().collect();
            waiters.extend(state.batch_queue.iter_mut().map(|batch| {
                batch.state = BatchState::ReadyToSend;
                batch.done.subscribe()
            }));
            waiters
        };
        debug!(batches = waiters.len(), "Flushing bulk writer");

        self.inner.send_ready_batches();
        for mut done in waiters {
            let _ = done.wait_for(|resolved| *resolved).await;
        }
    }

    /// Same as [`flush`](Self::flush).
    pub async fn wait_for_pending_writes(&self) {
        self.flush().await;
    }

    /// Flushes and rejects every later write with
    /// [`FiregateError::BulkWriterClosed`]. Calling it again only flushes.
    pub async fn close(&self) {
        let flush = self.flush();
        self.inner.lock_state().closed = true;
        flush.await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    fn enqueue(&self, write: Write) -> Result<PendingWrite> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(FiregateError::BulkWriterClosed);
            }

            let document = write.document().clone();
            let idx = self.inner.get_eligible_batch(&mut state, &document);
            let max_batch_size = self.inner.options.max_batch_size;
            let batch = &mut state.batch_queue[idx];
            batch.batch.push(write);
            batch.refs.insert(document);
            batch.results.push(tx);
            if batch.op_count() >= max_batch_size {
                batch.state = BatchState::ReadyToSend;
            }
        }

        self.inner.send_ready_batches();
        Ok(PendingWrite { rx })
    }
}

impl Inner {
    /// Index of the oldest open batch with room that does not contain
    /// `document`. Appends a new batch if there is none.
    fn get_eligible_batch(&self, state: &mut WriterState, document: &DocumentRef) -> usize {
        let mut conflict = false;
        for (idx, batch) in state.batch_queue.iter().enumerate() {
            if batch.state != BatchState::Open || batch.op_count() >= self.options.max_batch_size {
                continue;
            }
            if batch.refs.contains(document) {
                conflict = true;
                continue;
            }
            return idx;
        }

        if conflict {
            warn!(
                document = %document,
                "BulkWriter received multiple writes to the same document; throughput will be limited"
            );
        }

        let id = state.next_batch_id;
        state.next_batch_id = state.next_batch_id.wrapping_add(1);
        let (done, _) = watch::channel(false);
        state.batch_queue.push_back(BulkCommitBatch {
            id,
            state: BatchState::Open,
            refs: HashSet::new(),
            results: Vec::new(),
            batch: WriteBatch::new(Arc::clone(&self.committer)),
            done,
        });
        debug!(batch_id = id, "Created batch");
        state.batch_queue.len() - 1
    }

    /// Dispatches batches from the front of the queue until one cannot go.
    fn send_ready_batches(self: &Arc<Self>) {
        loop {
            let batch = {
                let mut guard = self.lock_state();
                let state = &mut *guard;
                let Some(front) = state.batch_queue.front() else {
                    return;
                };
                if front.state != BatchState::ReadyToSend {
                    return;
                }
                if !front.refs.is_disjoint(&state.refs_in_flight) {
                    debug!(
                        batch_id = front.id,
                        "Batch contains a document already in flight; waiting"
                    );
                    return;
                }

                let ops = front.op_count();
                if let Some(limiter) = state.rate_limiter.as_mut() {
                    let now = Instant::now();
                    if !limiter.try_make_request(ops, now) {
                        let delay = limiter.next_request_delay(ops, now);
                        if !state.retry_scheduled {
                            state.retry_scheduled = true;
                            debug!(batch_id = front.id, ?delay, "Throttling batch");
                            self.schedule_retry(delay);
                        }
                        return;
                    }
                }

                let Some(batch) = state.batch_queue.pop_front() else {
                    return;
                };
                state.refs_in_flight.extend(batch.refs.iter().cloned());
                state.batches_in_flight.insert(batch.id, batch.done.subscribe());
                batch
            };

            tokio::spawn(Arc::clone(self).commit_batch(batch));
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: std::time::Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.lock_state().retry_scheduled = false;
            inner.send_ready_batches();
        });
    }

    async fn commit_batch(self: Arc<Self>, batch: BulkCommitBatch) {
        let BulkCommitBatch {
            id,
            refs,
            results,
            batch,
            done,
            ..
        } = batch;
        debug!(batch_id = id, ops = results.len(), "Sending batch");

        match batch.bulk_commit().await {
            Ok(outcomes) => {
                if outcomes.len() < results.len() {
                    warn!(
                        batch_id = id,
                        expected = results.len(),
                        received = outcomes.len(),
                        "Commit response is missing write results"
                    );
                }
                let mut outcomes = outcomes.into_iter();
                for tx in results {
                    let result = match outcomes.next() {
                        Some(outcome) => outcome.into_result(),
                        None => Err(FiregateError::Internal(
                            "commit response has no result for this write".to_string(),
                        )),
                    };
                    let _ = tx.send(result);
                }
            }
            Err(e) => {
                warn!(batch_id = id, "Batch commit failed: {}", e);
                let status = e.to_status();
                for tx in results {
                    let _ = tx.send(Err(shared_error(&e, &status)));
                }
            }
        }

        {
            let mut state = self.lock_state();
            for document in &refs {
                state.refs_in_flight.remove(document);
            }
            state.batches_in_flight.remove(&id);
        }
        done.send_replace(true);
        debug!(batch_id = id, "Batch resolved");

        self.send_ready_batches();
    }

    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Copy of a commit error for one of the batch's writes. The fixed writer
/// errors keep their variant; everything else becomes its status.
fn shared_error(error: &FiregateError, status: &RpcStatus) -> FiregateError {
    match error {
        FiregateError::PoolTerminated => FiregateError::PoolTerminated,
        FiregateError::BulkWriterClosed => FiregateError::BulkWriterClosed,
        _ => FiregateError::Rpc(status.clone()),
    }
}
