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

//! HTTP Channel Integration Tests
//!
//! These tests run an in-process hyper server and verify that the HTTP
//! channel, alone and behind the RPC facade:
//! - Posts JSON to `/v1/{method}` with the call headers
//! - Maps HTTP failures to RPC codes
//! - Retries only when the call options ask for it
//! - Reads newline-delimited JSON streams through the handshake
//!
//! All servers bind `127.0.0.1:0` and are addressed as `http://127.0.0.1:PORT`.

use firegate_client::{
    CallOptions, Channel, HttpChannel, HttpChannelConfig, RpcConfig, RpcFacade,
    RESOURCE_PREFIX_HEADER,
};
use firegate_common::{get_retry_params, Code, FiregateError};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

type Handler =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync>;

fn make_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

/// Test server that runs on a separate task until dropped
struct TestServer {
    addr: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let io = TokioIo::new(stream);
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let handler = handler.clone();
                                async move { Ok::<_, hyper::Error>(handler(req).await) }
                            });
                            let _ = http1::Builder::new().serve_connection(io, service).await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn channel(&self) -> HttpChannel {
        HttpChannel::new(HttpChannelConfig::new(self.base_url()))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap()
}

fn ndjson_response(lines: &[Value]) -> Response<Full<Bytes>> {
    let mut body = String::new();
    for line in lines {
        body.push_str(&line.to_string());
        body.push('\n');
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/x-ndjson")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Echoes the path, the resource header and the request body.
fn echo_handler() -> Handler {
    make_handler(|req: Request<Incoming>| {
        async move {
            let path = req.uri().path().to_string();
            let prefix = req
                .headers()
                .get(RESOURCE_PREFIX_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let request: Value = serde_json::from_slice(&body).unwrap();
            json_response(
                StatusCode::OK,
                json!({"path": path, "prefix": prefix, "request": request}),
            )
        }
    })
}

// ============================================================================
// Unary Calls
// ============================================================================

#[tokio::test]
async fn test_unary_posts_to_method_path() {
    let server = TestServer::start(echo_handler()).await;
    let channel = server.channel();

    let response = channel
        .unary("getDocument", json!({"name": "users/alice"}), &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(response["path"], "/v1/getDocument");
    assert_eq!(response["request"], json!({"name": "users/alice"}));
}

#[tokio::test]
async fn test_facade_sends_resource_header() {
    let server = TestServer::start(echo_handler()).await;
    let base_url = server.base_url();
    let config = RpcConfig {
        database_resource: "projects/p/databases/d".to_string(),
        ..Default::default()
    };
    let facade = RpcFacade::new(config, move || {
        Ok(Arc::new(HttpChannel::new(HttpChannelConfig::new(base_url.clone()))))
    });

    let response = facade
        .unary_call("getDocument", json!({}), "tag01", None)
        .await
        .unwrap();
    assert_eq!(response["prefix"], "projects/p/databases/d");
    assert_eq!(facade.pool().size(), 1);
}

#[tokio::test]
async fn test_http_error_maps_to_rpc_code() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let calls = calls.clone();
        make_handler(move |_req: Request<Incoming>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": {"code": 404, "message": "document missing"}}),
                )
            }
        })
    };
    let server = TestServer::start(handler).await;

    let options = CallOptions {
        retry: Some(get_retry_params("getDocument")),
        ..Default::default()
    };
    let err = server
        .channel()
        .unary("getDocument", json!({}), &options)
        .await
        .unwrap_err();

    match err {
        FiregateError::Rpc(status) => {
            assert_eq!(status.code, Code::NotFound);
            assert_eq!(status.message, "document missing");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // NOT_FOUND is not retryable
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unary_retries_when_options_request_it() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let calls = calls.clone();
        make_handler(move |_req: Request<Incoming>| {
            let count = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    return json_response(StatusCode::SERVICE_UNAVAILABLE, json!({}));
                }
                json_response(StatusCode::OK, json!({"ok": true}))
            }
        })
    };
    let server = TestServer::start(handler).await;

    let options = CallOptions {
        retry: Some(get_retry_params("runQuery")),
        ..Default::default()
    };
    let response = server
        .channel()
        .unary("runQuery", json!({}), &options)
        .await
        .unwrap();

    assert_eq!(response, json!({"ok": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unary_without_retry_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let calls = calls.clone();
        make_handler(move |_req: Request<Incoming>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { json_response(StatusCode::SERVICE_UNAVAILABLE, json!({})) }
        })
    };
    let server = TestServer::start(handler).await;

    let err = server
        .channel()
        .unary("runQuery", json!({}), &CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unary_timeout() {
    let handler: Handler = make_handler(|_req: Request<Incoming>| {
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            json_response(StatusCode::OK, json!({}))
        }
    });
    let server = TestServer::start(handler).await;

    let options = CallOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let err = server
        .channel()
        .unary("getDocument", json!({}), &options)
        .await
        .unwrap_err();

    assert!(matches!(err, FiregateError::Timeout(100)));
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel = HttpChannel::new(HttpChannelConfig::new(format!("http://{}", addr)));
    let err = channel
        .unary("getDocument", json!({}), &CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FiregateError::Transport(_)));
    assert_eq!(err.code(), Code::Unavailable);
}

// ============================================================================
// Streams
// ============================================================================

fn stream_facade(server: &TestServer) -> RpcFacade<HttpChannel> {
    let base_url = server.base_url();
    RpcFacade::new(RpcConfig::default(), move || {
        Ok(Arc::new(HttpChannel::new(HttpChannelConfig::new(base_url.clone()))))
    })
}

#[tokio::test]
async fn test_stream_reads_ndjson_messages() {
    let handler: Handler = make_handler(|_req: Request<Incoming>| {
        async {
            ndjson_response(&[
                json!({"document": {"name": "a"}}),
                json!({"document": {"name": "b"}}),
                json!({"done": true}),
            ])
        }
    });
    let server = TestServer::start(handler).await;
    let facade = stream_facade(&server);

    let stream = facade
        .stream_call("runQuery", json!({"structuredQuery": {}}), "tag02")
        .await
        .unwrap();
    let messages: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;

    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["document"]["name"], "b");
    assert_eq!(messages[2], json!({"done": true}));
}

#[tokio::test]
async fn test_stream_error_before_data_rejects() {
    let handler: Handler = make_handler(|_req: Request<Incoming>| {
        async {
            ndjson_response(&[json!({"error": {"code": 7, "message": "denied"}})])
        }
    });
    let server = TestServer::start(handler).await;
    let facade = stream_facade(&server);

    let err = facade
        .stream_call("runQuery", json!({}), "tag03")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_stream_error_after_data_is_an_item() {
    let handler: Handler = make_handler(|_req: Request<Incoming>| {
        async {
            ndjson_response(&[
                json!({"document": {"name": "a"}}),
                json!({"error": {"code": 13, "message": "lost"}}),
            ])
        }
    });
    let server = TestServer::start(handler).await;
    let facade = stream_facade(&server);

    let mut stream = facade
        .stream_call("runQuery", json!({}), "tag04")
        .await
        .unwrap();

    assert!(stream.next().await.unwrap().is_ok());
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_bidirectional_stream_is_unimplemented() {
    let server = TestServer::start(echo_handler()).await;
    let facade = stream_facade(&server);

    let err = facade
        .stream_call("listen", json!({}), "tag05")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn test_concurrent_calls_share_pool() {
    let server = TestServer::start(echo_handler()).await;
    let facade = Arc::new(stream_facade(&server));

    let tasks = (0..10)
        .map(|i| {
            let facade = facade.clone();
            tokio::spawn(async move {
                facade
                    .unary_call("getDocument", json!({"index": i}), "tag06", None)
                    .await
            })
        })
        .collect::<Vec<_>>();

    let results = futures::future::join_all(tasks).await;
    for (i, result) in results.into_iter().enumerate() {
        let response = result.unwrap().unwrap();
        assert_eq!(response["request"], json!({"index": i}));
    }
    assert_eq!(facade.pool().op_count(), 0);
    assert_eq!(facade.pool().size(), 1);
}
