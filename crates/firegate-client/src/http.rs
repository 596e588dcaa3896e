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

//! HTTP/JSON channel.
//!
//! Every method maps to `POST {endpoint}/v1/{method}` with the request as the
//! JSON body. Unary responses are a single JSON document. Streaming responses
//! are newline-delimited JSON, one message per line; a line of the form
//! `{"error": {"code": .., "message": ..}}` ends the stream with that status.
//!
//! HTTP/1 cannot carry bidirectional streams, so `listen` and `write` are
//! rejected with `UNIMPLEMENTED`.

use crate::channel::{CallOptions, Channel, RawStream};
use async_trait::async_trait;
use firegate_common::{retry_with_options, Code, FiregateError, Result, RpcMessage, RpcStatus};
use futures::stream::{self, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// HTTP channel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpChannelConfig {
    /// Base URL, e.g. `http://127.0.0.1:8080`
    pub endpoint: String,
    /// Deadline for a unary call, and for receiving the headers of a stream.
    /// Default: 60000ms
    pub timeout_ms: u64,
}

impl Default for HttpChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 60_000,
        }
    }
}

impl HttpChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

/// A [`Channel`] speaking JSON over HTTP/1.
pub struct HttpChannel {
    config: HttpChannelConfig,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpChannel {
    pub fn new(config: HttpChannelConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { config, client }
    }

    pub fn config(&self) -> &HttpChannelConfig {
        &self.config
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/v1/{}", self.config.endpoint.trim_end_matches('/'), method)
    }

    fn deadline(&self, options: &CallOptions) -> Duration {
        options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.timeout_ms))
    }

    /// Sends one request and returns the response once its headers arrived.
    /// Non-2xx responses are turned into RPC errors.
    async fn send(
        &self,
        method: &str,
        request: &RpcMessage,
        options: &CallOptions,
    ) -> Result<Response<Incoming>> {
        let body = serde_json::to_vec(request)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.method_url(method))
            .header("Content-Type", "application/json");
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| FiregateError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let deadline = self.deadline(options);
        let response = tokio::time::timeout(deadline, self.client.request(http_request))
            .await
            .map_err(|_| FiregateError::Timeout(deadline.as_millis() as u64))?
            .map_err(|e| FiregateError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FiregateError::Transport(format!("Failed to read error body: {}", e)))?
            .to_bytes();
        Err(error_from_body(status.as_u16(), &bytes))
    }

    async fn post_json(
        &self,
        method: &str,
        request: &RpcMessage,
        options: &CallOptions,
    ) -> Result<RpcMessage> {
        let deadline = self.deadline(options);
        let call = async {
            let response = self.send(method, request, options).await?;
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| FiregateError::Transport(format!("Failed to read response: {}", e)))?
                .to_bytes();
            serde_json::from_slice(&bytes)
                .map_err(|e| FiregateError::InvalidResponse(format!("Malformed JSON response: {}", e)))
        };
        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| FiregateError::Timeout(deadline.as_millis() as u64))?
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn unary(
        &self,
        method: &str,
        request: RpcMessage,
        options: &CallOptions,
    ) -> Result<RpcMessage> {
        debug!(method, url = %self.method_url(method), "POST");
        retry_with_options(options.retry.as_ref(), |_| {
            self.post_json(method, &request, options)
        })
        .await
    }

    async fn open_stream(
        &self,
        method: &str,
        request: Option<RpcMessage>,
        options: &CallOptions,
    ) -> Result<RawStream> {
        let Some(request) = request else {
            return Err(FiregateError::rpc(
                Code::Unimplemented,
                format!("bidirectional method {} is not supported over HTTP", method),
            ));
        };

        debug!(method, url = %self.method_url(method), "POST (stream)");
        let response = self.send(method, &request, options).await?;
        Ok(RawStream::unidirectional(ndjson_stream(response.into_body())))
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    message: String,
}

/// Builds the error for a non-2xx response. The HTTP status decides the code;
/// the message comes from a JSON error envelope if there is one.
fn error_from_body(http_status: u16, body: &[u8]) -> FiregateError {
    let code = Code::from_http_status(http_status);
    let message = match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    };
    FiregateError::Rpc(RpcStatus::new(code, message))
}

/// Parses one NDJSON line. An error envelope carries an RPC code directly.
fn parse_line(line: &[u8]) -> Result<RpcMessage> {
    let value: Value = serde_json::from_slice(line)
        .map_err(|e| FiregateError::InvalidResponse(format!("Malformed stream message: {}", e)))?;
    if value.get("error").is_some() {
        if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(value.clone()) {
            let code = envelope
                .error
                .code
                .and_then(|c| Code::try_from(c).ok())
                .unwrap_or(Code::Unknown);
            return Err(FiregateError::rpc(code, envelope.error.message));
        }
    }
    Ok(value)
}

struct NdjsonState {
    body: Incoming,
    buffer: Vec<u8>,
    pending: VecDeque<Result<RpcMessage>>,
    done: bool,
}

impl NdjsonState {
    /// Moves every complete line of the buffer into `pending`.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = trim_ascii(&line);
            if !line.is_empty() {
                self.pending.push_back(parse_line(line));
            }
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Turns a response body into a stream of messages. An `Err` item ends the
/// stream.
fn ndjson_stream(body: Incoming) -> crate::channel::InboundStream {
    let state = NdjsonState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.pending.clear();
                    state.done = true;
                }
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        state.buffer.extend_from_slice(&data);
                        state.drain_lines();
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(FiregateError::Stream(format!("Stream body failed: {}", e))),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    let rest = std::mem::take(&mut state.buffer);
                    let rest = trim_ascii(&rest);
                    if !rest.is_empty() {
                        state.pending.push_back(parse_line(rest));
                    }
                }
            }
        }
    })
    .boxed()
}
