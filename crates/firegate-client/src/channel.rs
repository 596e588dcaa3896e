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

//! Backend channel seam.
//!
//! A [`Channel`] is one heavyweight backend connection (a stub). The
//! [`ClientPool`](crate::pool::ClientPool) shares a few of them across many
//! logical operations; the [`RpcFacade`](crate::rpc::RpcFacade) only talks to
//! the backend through this trait, so the wire encoding stays an
//! implementation detail of the channel.

use async_trait::async_trait;
use firegate_common::{Result, RetryParams, RpcMessage};
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stream of messages received from the backend.
pub type InboundStream = BoxStream<'static, Result<RpcMessage>>;

/// Sink for messages sent to the backend on a bidirectional stream.
pub type RequestSink = mpsc::UnboundedSender<RpcMessage>;

/// Per-call options passed to the channel.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Headers attached to the call (routing, resource prefix, custom headers)
    pub headers: BTreeMap<String, String>,
    /// Retry parameters for unary calls. `None` means the call runs once.
    pub retry: Option<RetryParams>,
    /// Overrides the channel's default deadline
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A freshly opened, not yet handshaked stream.
pub struct RawStream {
    /// Messages from the backend. An `Err` item is terminal.
    pub inbound: InboundStream,
    /// Request sink, present for bidirectional streams only.
    pub outbound: Option<RequestSink>,
}

impl RawStream {
    pub fn unidirectional(inbound: InboundStream) -> Self {
        Self {
            inbound,
            outbound: None,
        }
    }

    pub fn bidirectional(inbound: InboundStream, outbound: RequestSink) -> Self {
        Self {
            inbound,
            outbound: Some(outbound),
        }
    }
}

/// One backend connection.
///
/// Implementations must be cheap to share (`Send + Sync`); the pool hands the
/// same instance to up to `concurrent_operation_limit` operations at once.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Issues a unary call. Implementations apply `options.retry` themselves,
    /// typically via [`firegate_common::retry_with_options`].
    async fn unary(
        &self,
        method: &str,
        request: RpcMessage,
        options: &CallOptions,
    ) -> Result<RpcMessage>;

    /// Opens a stream. Unidirectional streams receive the request here;
    /// bidirectional streams get `None` and must return an outbound sink the
    /// caller writes the request to.
    async fn open_stream(
        &self,
        method: &str,
        request: Option<RpcMessage>,
        options: &CallOptions,
    ) -> Result<RawStream>;
}
