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

//! Firegate
//!
//! Transport and write coordination for a remote document database client.
//!
//! - [`ClientPool`] shares a few backend channels across many operations
//! - [`RpcFacade`] issues pooled, retried unary calls and handshaked streams
//! - [`BulkWriter`] batches writes while keeping each document's writes apart
//!
//! # Example
//!
//! ```rust,no_run
//! use firegate::{BulkWriter, BulkWriterOptions, HttpChannel, HttpChannelConfig, RpcConfig, RpcFacade};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> firegate::Result<()> {
//! firegate::init_tracing();
//!
//! let facade = Arc::new(RpcFacade::new(RpcConfig::default(), || {
//!     Ok(Arc::new(HttpChannel::new(HttpChannelConfig::new("http://127.0.0.1:8080"))))
//! }));
//! let writer = BulkWriter::with_facade(facade.clone(), BulkWriterOptions::default());
//!
//! let write = writer.set("users/alice", json!({"name": "Alice"}))?;
//! writer.close().await;
//! write.await?;
//! facade.terminate().await;
//! # Ok(())
//! # }
//! ```

pub use firegate_bulk::{
    BulkWriter, BulkWriterOptions, Committer, PendingWrite, RateLimiter, RpcCommitter,
    ThrottlingConfig, Write, WriteBatch, WriteOutcome,
};
pub use firegate_client::{
    CallOptions, Channel, ClientPool, DuplexStream, HandshakeState, HttpChannel,
    HttpChannelConfig, PoolConfig, RawStream, RpcConfig, RpcFacade, StreamRetryConfig,
};
pub use firegate_common::{
    generate_request_tag, BackoffConfig, Code, DocumentRef, ExponentialBackoff, FiregateError,
    Result, RetryParams, RpcMessage, RpcStatus, Timestamp, WriteResult,
};

/// Installs a formatting subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling it again, or after another subscriber was installed, does nothing.
pub fn init_tracing() {
    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
