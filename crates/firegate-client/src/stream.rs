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

//! Stream initialization handshake.
//!
//! A freshly opened stream is not handed to the caller until it has proven
//! itself: the first message, or a clean end of stream, moves it out of the
//! handshake. An error observed before that point fails the open attempt
//! (and may be retried); an error observed afterwards is delivered as an
//! `Err` item on the stream the caller already holds.
//!
//! # States
//!
//! | State | Entered when | Caller visible |
//! |-------|--------------|----------------|
//! | `Unresolved` | stream opened, nothing observed yet | no |
//! | `Ready` | first message observed | yes, first message is buffered |
//! | `Ended` | end of stream, terminal error, or caller done | yes, yields `None` |
//!
//! Reaching `Ended` drops the inbound stream and fires the lifetime signal,
//! which is what lets the pool take its client back.

use crate::channel::{InboundStream, RawStream, RequestSink};
use firegate_common::{FiregateError, Result, RpcMessage};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unresolved,
    Ready,
    Ended,
}

/// Messages received on a handshaked stream.
pub struct ResponseStream {
    state: HandshakeState,
    /// Message observed during the handshake, not yet delivered
    buffered: Option<RpcMessage>,
    inbound: Option<InboundStream>,
    /// Dropped when the stream ends; the receiving side releases the client
    lifetime: Option<oneshot::Sender<()>>,
}

impl ResponseStream {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn end(&mut self) {
        self.state = HandshakeState::Ended;
        self.buffered = None;
        self.inbound = None;
        self.lifetime = None;
    }
}

impl Stream for ResponseStream {
    type Item = Result<RpcMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state != HandshakeState::Ready {
            return Poll::Ready(None);
        }
        if let Some(message) = this.buffered.take() {
            return Poll::Ready(Some(Ok(message)));
        }
        let Some(inbound) = this.inbound.as_mut() else {
            this.end();
            return Poll::Ready(None);
        };
        match inbound.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Err(e))) => {
                debug!("Forwarding stream error received after handshake: {}", e);
                this.end();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.end();
                Poll::Ready(None)
            }
        }
    }
}

/// A handshaked stream returned by
/// [`RpcFacade::stream_call`](crate::rpc::RpcFacade::stream_call).
///
/// Reading yields backend messages; for bidirectional methods further
/// requests can be written with [`send`](Self::send).
pub struct DuplexStream {
    responses: ResponseStream,
    requests: Option<RequestSink>,
}

impl DuplexStream {
    pub fn is_bidirectional(&self) -> bool {
        self.requests.is_some()
    }

    pub fn state(&self) -> HandshakeState {
        self.responses.state()
    }

    /// Writes a request on a bidirectional stream.
    pub fn send(&self, request: RpcMessage) -> Result<()> {
        let sink = self.requests.as_ref().ok_or_else(|| {
            FiregateError::InvalidRequest("cannot write to a unidirectional stream".to_string())
        })?;
        sink.send(request)
            .map_err(|_| FiregateError::Stream("stream is closed for writing".to_string()))
    }

    /// Stops writing. The backend sees the end of the request stream; reading
    /// continues until the backend ends its side.
    pub fn close_send(&mut self) {
        self.requests = None;
    }

    pub fn into_parts(self) -> (ResponseStream, Option<RequestSink>) {
        (self.responses, self.requests)
    }
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("state", &self.state())
            .field("bidirectional", &self.is_bidirectional())
            .finish()
    }
}

impl Stream for DuplexStream {
    type Item = Result<RpcMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().responses).poll_next(cx)
    }
}

/// Runs the handshake on a raw stream.
///
/// For bidirectional streams `request` is written onto the outbound sink
/// first. The returned stream holds `lifetime` until it ends.
pub(crate) async fn initialize_stream(
    raw: RawStream,
    request: Option<RpcMessage>,
    lifetime: oneshot::Sender<()>,
) -> Result<DuplexStream> {
    let RawStream {
        mut inbound,
        outbound,
    } = raw;

    if let Some(request) = request {
        let sink = outbound.as_ref().ok_or_else(|| {
            FiregateError::Stream("bidirectional stream opened without a request sink".to_string())
        })?;
        sink.send(request).map_err(|_| {
            FiregateError::Stream("stream closed before the request was written".to_string())
        })?;
    }

    let mut responses = ResponseStream {
        state: HandshakeState::Unresolved,
        buffered: None,
        inbound: None,
        lifetime: Some(lifetime),
    };

    match inbound.next().await {
        Some(Ok(message)) => {
            responses.state = HandshakeState::Ready;
            responses.buffered = Some(message);
            responses.inbound = Some(inbound);
        }
        Some(Err(e)) => return Err(e),
        None => responses.end(),
    }

    Ok(DuplexStream {
        responses,
        requests: outbound,
    })
}
