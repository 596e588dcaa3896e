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

use firegate_common::{FiregateError, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Creates a new client. Must never return an instance the pool already
/// tracks.
pub type ClientFactory<T> = Box<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

/// Disposes of a client the pool no longer needs.
pub type ClientDestructor<T> = Box<dyn Fn(Arc<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Client pool configuration.
///
/// # Default Configuration
///
/// - `concurrent_operation_limit`: 100
/// - `max_idle_clients`: 1
///
/// # Example
///
/// ```rust
/// use firegate_client::PoolConfig;
///
/// // Two operations per client, no idle clients retained
/// let config = PoolConfig {
///     concurrent_operation_limit: 2,
///     max_idle_clients: 0,
/// };
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of outstanding operations per client
    pub concurrent_operation_limit: usize,
    /// Number of fully idle clients worth of spare capacity to keep around
    pub max_idle_clients: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrent_operation_limit: 100,
            max_idle_clients: 1,
        }
    }
}

struct PooledClient<T> {
    client: Arc<T>,
    outstanding: usize,
}

struct PoolState<T> {
    /// Clients in creation order
    active: Vec<PooledClient<T>>,
    terminated: bool,
}

impl<T> PoolState<T> {
    fn total_outstanding(&self) -> usize {
        self.active.iter().map(|entry| entry.outstanding).sum()
    }

    fn position(&self, client: &Arc<T>) -> Option<usize> {
        self.active
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.client, client))
    }
}

/// Pool of backend clients.
///
/// The pool shares a small number of heavyweight clients across an unbounded
/// number of logical operations. Operations are executed with
/// [`run`](Self::run), which leases a client for the duration of the
/// operation.
///
/// # Architecture
///
/// - Each client serves at most `concurrent_operation_limit` operations at once
/// - New work goes to the fullest client that still has room (bin packing),
///   so idle clients collect at the edges
/// - A client is destroyed once it is idle and the pool's spare capacity
///   exceeds `max_idle_clients * concurrent_operation_limit`
/// - [`terminate`](Self::terminate) waits for outstanding operations and then
///   destroys every client
///
/// # Thread Safety
///
/// The bookkeeping is behind a synchronous mutex that is never held across an
/// `.await`, so the pool can be shared freely between tasks.
///
/// # Example
///
/// ```rust,no_run
/// use firegate_client::{ClientPool, PoolConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> firegate_common::Result<()> {
/// let pool = ClientPool::new(PoolConfig::default(), || Ok(Arc::new(String::from("client"))));
///
/// let len = pool.run(|client| async move { Ok(client.len()) }).await?;
///
/// pool.terminate().await;
/// # Ok(())
/// # }
/// ```
pub struct ClientPool<T> {
    config: PoolConfig,
    factory: ClientFactory<T>,
    destructor: ClientDestructor<T>,
    state: Mutex<PoolState<T>>,
    /// Flips to `true` once the pool is terminated and fully drained
    drained: watch::Sender<bool>,
}

impl<T: Send + Sync + 'static> ClientPool<T> {
    /// Creates a pool whose clients are disposed of by simply dropping them.
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let (drained, _) = watch::channel(false);
        Self {
            config: PoolConfig {
                concurrent_operation_limit: config.concurrent_operation_limit.max(1),
                ..config
            },
            factory: Box::new(factory),
            destructor: Box::new(|_| Box::pin(async { Ok(()) })),
            state: Mutex::new(PoolState {
                active: Vec::new(),
                terminated: false,
            }),
            drained,
        }
    }

    /// Sets the function used to dispose of clients.
    ///
    /// Destructor failures are logged and otherwise ignored; they never change
    /// the result of the operation that triggered the collection.
    pub fn with_destructor<D, Fut>(mut self, destructor: D) -> Self
    where
        D: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.destructor = Box::new(move |client| Box::pin(destructor(client)));
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of clients currently alive.
    pub fn size(&self) -> usize {
        self.lock_state().active.len()
    }

    /// Number of operations currently running across all clients.
    pub fn op_count(&self) -> usize {
        self.lock_state().total_outstanding()
    }

    /// Returns `true` once [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.lock_state().terminated
    }

    /// Runs `op` against a pooled client.
    ///
    /// The client is released when `op` settles, on success and on failure.
    /// If the release leaves the client collectable, it is destroyed before
    /// this method returns. The result is exactly what `op` produced.
    ///
    /// # Errors
    ///
    /// Returns [`FiregateError::PoolTerminated`] without running `op` if the
    /// pool has been terminated, and [`FiregateError::Internal`] if the factory
    /// breaks its contract.
    pub async fn run<V, F, Fut>(&self, op: F) -> Result<V>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let lease = self.acquire()?;
        let result = op(Arc::clone(&lease.client)).await;

        if let Some(idle) = lease.release() {
            self.destroy(idle).await;
        }
        result
    }

    /// Terminates the pool.
    ///
    /// New operations are rejected immediately. Outstanding operations are
    /// allowed to finish, after which every remaining client is destroyed.
    pub async fn terminate(&self) {
        let mut drained = {
            let mut state = self.lock_state();
            state.terminated = true;
            if state.total_outstanding() == 0 {
                self.drained.send_replace(true);
            }
            self.drained.subscribe()
        };

        let _ = drained.wait_for(|done| *done).await;

        let clients: Vec<Arc<T>> = {
            let mut state = self.lock_state();
            state.active.drain(..).map(|entry| entry.client).collect()
        };
        debug!(count = clients.len(), "Destroying clients on termination");
        for client in clients {
            self.destroy(client).await;
        }
    }

    /// Picks the fullest client below the limit or creates a new one.
    fn acquire(&self) -> Result<ClientLease<'_, T>> {
        let mut state = self.lock_state();
        if state.terminated {
            return Err(FiregateError::PoolTerminated);
        }

        let limit = self.config.concurrent_operation_limit;
        let mut selected: Option<usize> = None;
        for (idx, entry) in state.active.iter().enumerate() {
            if entry.outstanding >= limit {
                continue;
            }
            let fuller = match selected {
                Some(current) => entry.outstanding > state.active[current].outstanding,
                None => true,
            };
            if fuller {
                selected = Some(idx);
            }
        }

        let idx = match selected {
            Some(idx) => idx,
            None => {
                let client = (self.factory)()?;
                if state.position(&client).is_some() {
                    return Err(FiregateError::Internal(
                        "client factory returned a client that is already pooled".to_string(),
                    ));
                }
                state.active.push(PooledClient {
                    client,
                    outstanding: 0,
                });
                debug!(size = state.active.len(), "Created new client");
                state.active.len() - 1
            }
        };

        let entry = &mut state.active[idx];
        entry.outstanding += 1;
        Ok(ClientLease {
            pool: self,
            client: Arc::clone(&entry.client),
            released: false,
        })
    }

    /// Decrements the client's count. Returns the client if it should be
    /// garbage collected; it has already been removed from the pool.
    fn release_client(&self, client: &Arc<T>) -> Option<Arc<T>> {
        let mut state = self.lock_state();
        let idx = state.position(client)?;
        let entry = &mut state.active[idx];
        entry.outstanding = entry.outstanding.saturating_sub(1);

        if state.terminated && state.total_outstanding() == 0 {
            self.drained.send_replace(true);
        }

        if self.should_garbage_collect(&state, idx) {
            debug!(size = state.active.len() - 1, "Garbage collecting idle client");
            Some(state.active.remove(idx).client)
        } else {
            None
        }
    }

    /// An idle client is collectable only when the pool's spare capacity
    /// exceeds the configured idle budget.
    fn should_garbage_collect(&self, state: &PoolState<T>, idx: usize) -> bool {
        if state.active[idx].outstanding != 0 {
            return false;
        }
        let limit = self.config.concurrent_operation_limit;
        let idle_capacity: usize = state
            .active
            .iter()
            .map(|entry| limit - entry.outstanding)
            .sum();
        idle_capacity > self.config.max_idle_clients * limit
    }

    async fn destroy(&self, client: Arc<T>) {
        if let Err(e) = (self.destructor)(client).await {
            warn!("Failed to destroy pooled client: {}", e);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A leased client. Dropping the lease without calling
/// [`release`](Self::release) (e.g. when the operation future is cancelled)
/// still returns the slot to the pool, but skips garbage collection.
struct ClientLease<'a, T: Send + Sync + 'static> {
    pool: &'a ClientPool<T>,
    client: Arc<T>,
    released: bool,
}

impl<T: Send + Sync + 'static> ClientLease<'_, T> {
    fn release(mut self) -> Option<Arc<T>> {
        self.released = true;
        self.pool.release_client(&self.client)
    }
}

impl<T: Send + Sync + 'static> Drop for ClientLease<'_, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.pool.lock_state();
        if let Some(idx) = state.position(&self.client) {
            let entry = &mut state.active[idx];
            entry.outstanding = entry.outstanding.saturating_sub(1);
            if state.terminated && state.total_outstanding() == 0 {
                self.pool.drained.send_replace(true);
            }
        }
    }
}
