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

//! Pooled, retrying RPC facade.
//!
//! [`RpcFacade`] turns a [`ClientPool`] of [`Channel`]s into two call sites:
//!
//! - [`unary_call`](RpcFacade::unary_call) runs one request/response exchange
//!   on a pooled channel. Retries are encoded in the [`CallOptions`] and
//!   applied by the channel itself.
//! - [`stream_call`](RpcFacade::stream_call) opens a stream with an explicit
//!   retry loop and hands it out only after the handshake succeeded. The
//!   channel stays leased until the caller has finished with the stream.

use crate::channel::{CallOptions, Channel};
use crate::pool::{ClientPool, PoolConfig};
use crate::stream::{initialize_stream, DuplexStream};
use firegate_common::{
    get_retry_params, is_permanent_rpc_error, BackoffConfig, Code, ExponentialBackoff,
    FiregateError, Result, RpcMessage,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Header carrying the database resource the call targets.
pub const RESOURCE_PREFIX_HEADER: &str = "x-resource-prefix";

/// Header carrying routing parameters (`database=<resource>`).
pub const ROUTING_HEADER: &str = "x-request-params";

/// Methods whose streams carry requests in both directions.
pub const BIDIRECTIONAL_METHODS: &[&str] = &["listen", "write"];

pub fn is_bidirectional(method: &str) -> bool {
    BIDIRECTIONAL_METHODS.contains(&method)
}

/// Retry settings for opening streams.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamRetryConfig {
    /// Total open attempts including the first one.
    /// Default: 5
    pub max_attempts: u32,
}

impl Default for StreamRetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Facade configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Resource name attached to every call, e.g.
    /// `projects/p/databases/(default)`
    pub database_resource: String,
    pub stream_retry: StreamRetryConfig,
    /// Backoff between stream open attempts
    pub backoff: BackoffConfig,
    pub pool: PoolConfig,
    /// Extra headers sent with every call
    pub custom_headers: BTreeMap<String, String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            database_resource: "projects/default/databases/(default)".to_string(),
            stream_retry: StreamRetryConfig::default(),
            backoff: BackoffConfig::default(),
            pool: PoolConfig::default(),
            custom_headers: BTreeMap::new(),
        }
    }
}

/// RPC call sites backed by a pool of channels.
///
/// # Example
///
/// ```rust,no_run
/// use firegate_client::{HttpChannel, HttpChannelConfig, RpcConfig, RpcFacade};
/// use firegate_common::generate_request_tag;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> firegate_common::Result<()> {
/// let facade = RpcFacade::new(RpcConfig::default(), || {
///     Ok(Arc::new(HttpChannel::new(HttpChannelConfig::new("http://127.0.0.1:8080"))))
/// });
///
/// let tag = generate_request_tag();
/// let doc = facade
///     .unary_call("getDocument", json!({"name": "users/alice"}), &tag, None)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcFacade<C: Channel> {
    config: RpcConfig,
    pool: Arc<ClientPool<C>>,
}

impl<C: Channel> RpcFacade<C> {
    pub fn new<F>(config: RpcConfig, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<C>> + Send + Sync + 'static,
    {
        let pool = Arc::new(ClientPool::new(config.pool.clone(), factory));
        Self::from_pool(config, pool)
    }

    /// Uses an existing pool, e.g. one with a custom destructor.
    pub fn from_pool(config: RpcConfig, pool: Arc<ClientPool<C>>) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ClientPool<C>> {
        &self.pool
    }

    /// Builds the options for one call. Routing headers are always set;
    /// retry parameters only when `retry_codes` is given.
    pub fn create_call_options(&self, method: &str, retry_codes: Option<&[Code]>) -> CallOptions {
        let mut headers = self.config.custom_headers.clone();
        headers.insert(
            RESOURCE_PREFIX_HEADER.to_string(),
            self.config.database_resource.clone(),
        );
        headers.insert(
            ROUTING_HEADER.to_string(),
            format!("database={}", self.config.database_resource),
        );

        CallOptions {
            headers,
            retry: retry_codes.map(|codes| get_retry_params(method).with_codes(codes)),
            timeout: None,
        }
    }

    /// Issues a unary call on a pooled channel.
    ///
    /// Failures propagate unchanged; the only retries are the ones the channel
    /// applies for `retry_codes`.
    pub async fn unary_call(
        &self,
        method: &str,
        request: RpcMessage,
        request_tag: &str,
        retry_codes: Option<&[Code]>,
    ) -> Result<RpcMessage> {
        let options = self.create_call_options(method, retry_codes);
        debug!(request_tag, method, "Sending unary request");

        let result = self
            .pool
            .run(|client| async move { client.unary(method, request, &options).await })
            .await;

        match &result {
            Ok(_) => debug!(request_tag, method, "Received unary response"),
            Err(e) => debug!(request_tag, method, "Unary request failed: {}", e),
        }
        result
    }

    /// Opens a stream and returns it once the handshake has succeeded.
    ///
    /// Open attempts are retried with backoff until `max_attempts` is reached
    /// or an error is permanent for `method`. Errors the backend reports after
    /// the first message are delivered on the returned stream instead.
    pub async fn stream_call(
        &self,
        method: &str,
        request: RpcMessage,
        request_tag: &str,
    ) -> Result<DuplexStream> {
        let max_attempts = self.config.stream_retry.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if let Some(e) = &last_error {
                warn!(
                    request_tag,
                    method,
                    attempt,
                    "Stream open failed: {}, retrying",
                    e
                );
            }
            backoff.backoff_and_wait().await?;

            debug!(request_tag, method, attempt = attempt + 1, "Opening stream");
            match self.open_stream_once(method, request.clone()).await {
                Ok(stream) => {
                    debug!(request_tag, method, "Stream is ready");
                    return Ok(stream);
                }
                Err(e) => {
                    let permanent = is_permanent_rpc_error(&e, method);
                    last_error = Some(e);
                    if permanent {
                        break;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            FiregateError::Internal("stream call made no attempts".to_string())
        });
        debug!(request_tag, method, "Stream call failed: {}", err);
        Err(err)
    }

    /// Terminates the underlying pool.
    pub async fn terminate(&self) {
        self.pool.terminate().await;
    }

    /// One open attempt. The pooled operation runs on its own task and
    /// finishes only when the handed-out stream ends or is dropped.
    async fn open_stream_once(&self, method: &str, request: RpcMessage) -> Result<DuplexStream> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<DuplexStream>>();
        let pool = Arc::clone(&self.pool);
        let options = self.create_call_options(method, None);
        let method = method.to_string();
        let bidirectional = is_bidirectional(&method);

        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let ready = &mut ready_tx;

            let outcome = pool
                .run(move |client| async move {
                    let (open_request, write_request) = if bidirectional {
                        (None, Some(request))
                    } else {
                        (Some(request), None)
                    };
                    let raw = client.open_stream(&method, open_request, &options).await?;

                    let (lifetime_tx, lifetime_rx) = oneshot::channel::<()>();
                    let stream = initialize_stream(raw, write_request, lifetime_tx).await?;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(stream));
                    }
                    // Resolves (with an error) once the stream has been dropped
                    let _ = lifetime_rx.await;
                    Ok(())
                })
                .await;

            if let Err(e) = outcome {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e));
                }
            }
        });

        ready_rx.await.map_err(|_| {
            FiregateError::Internal("stream open task ended without a result".to_string())
        })?
    }
}
