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

//! Per-method retry parameters and the unary retry driver.
//!
//! Every backend method has a set of status codes that are safe to retry and
//! backoff parameters for doing so. The table mirrors the backend's published
//! client configuration:
//!
//! | Methods | Retry codes |
//! |---------|-------------|
//! | reads, `listen`, `beginTransaction`, `rollback`, `deleteDocument` | DEADLINE_EXCEEDED, RESOURCE_EXHAUSTED, INTERNAL, UNAVAILABLE |
//! | `commit`, `createDocument`, `updateDocument` | RESOURCE_EXHAUSTED, UNAVAILABLE |
//! | `batchWrite` | RESOURCE_EXHAUSTED, ABORTED, UNAVAILABLE |
//! | `write` and unknown methods | none |
//!
//! [`retry_with_options`] is the retry wrapper a concrete channel applies to
//! unary calls whose call options carry retry parameters.

use crate::protocol::error::{FiregateError, Result};
use crate::protocol::status::Code;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const IDEMPOTENT_CODES: &[Code] = &[
    Code::DeadlineExceeded,
    Code::ResourceExhausted,
    Code::Internal,
    Code::Unavailable,
];

const NON_IDEMPOTENT_CODES: &[Code] = &[Code::ResourceExhausted, Code::Unavailable];

const BATCH_WRITE_CODES: &[Code] = &[Code::ResourceExhausted, Code::Aborted, Code::Unavailable];

/// Retry parameters for one method.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryParams {
    /// Status codes that trigger a retry
    pub codes: Vec<Code>,
    /// Delay before the first retry.
    /// Default: 100ms
    pub initial_backoff_ms: u64,
    /// Each retry waits: previous_backoff * multiplier
    /// Default: 1.3
    pub backoff_multiplier: f64,
    /// Cap on the delay between retries.
    /// Default: 60000ms
    pub max_backoff_ms: u64,
    /// Total attempts including the first one.
    /// Default: 5
    pub max_attempts: u32,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            codes: Vec::new(),
            initial_backoff_ms: 100,
            backoff_multiplier: 1.3,
            max_backoff_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryParams {
    /// Replaces the retry codes, keeping the backoff parameters.
    pub fn with_codes(mut self, codes: &[Code]) -> Self {
        self.codes = codes.to_vec();
        self
    }

    pub fn is_retryable(&self, code: Code) -> bool {
        self.codes.contains(&code)
    }

    fn next_backoff_ms(&self, backoff_ms: u64) -> u64 {
        std::cmp::min(
            (backoff_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// Status codes the backend considers retryable for `method`.
pub fn get_retry_codes(method: &str) -> &'static [Code] {
    match method {
        "batchGetDocuments" | "getDocument" | "listDocuments" | "listCollectionIds"
        | "runQuery" | "runAggregationQuery" | "partitionQuery" | "listen"
        | "beginTransaction" | "rollback" | "deleteDocument" => IDEMPOTENT_CODES,
        "commit" | "createDocument" | "updateDocument" => NON_IDEMPOTENT_CODES,
        "batchWrite" => BATCH_WRITE_CODES,
        _ => &[],
    }
}

/// Retry parameters for `method`.
pub fn get_retry_params(method: &str) -> RetryParams {
    RetryParams::default().with_codes(get_retry_codes(method))
}

/// Returns `true` if retrying `method` after `err` cannot succeed.
///
/// Errors carrying a backend code are permanent unless the code is in the
/// method's retry set. Errors without a code (connection resets, stream
/// failures) are treated as transient, except for a terminated pool or a
/// closed writer, which never recover.
pub fn is_permanent_rpc_error(err: &FiregateError, method: &str) -> bool {
    match err {
        FiregateError::PoolTerminated | FiregateError::BulkWriterClosed => true,
        FiregateError::Rpc(status) => !get_retry_codes(method).contains(&status.code),
        _ => false,
    }
}

/// Runs `call` and retries it according to `params`.
///
/// With `params == None` the call runs exactly once. Otherwise the call is
/// retried while the error's code is in `params.codes` and attempts remain,
/// waiting with exponential backoff between attempts. The closure receives
/// the zero-based attempt number.
pub async fn retry_with_options<T, F, Fut>(params: Option<&RetryParams>, mut call: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(params) = params else {
        return call(0).await;
    };

    let max_attempts = params.max_attempts.max(1);
    let mut backoff_ms = params.initial_backoff_ms;
    let mut attempt = 0;

    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let code = e.code();
                if attempt + 1 < max_attempts && params.is_retryable(code) {
                    warn!(
                        "call failed (attempt {}): {}, retrying in {}ms",
                        attempt + 1,
                        e,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = params.next_backoff_ms(backoff_ms);
                    attempt += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_params_default() {
        let params = RetryParams::default();
        assert!(params.codes.is_empty());
        assert_eq!(params.initial_backoff_ms, 100);
        assert_eq!(params.backoff_multiplier, 1.3);
        assert_eq!(params.max_backoff_ms, 60_000);
        assert_eq!(params.max_attempts, 5);
    }

    #[test]
    fn test_retry_params_from_json() {
        let params: RetryParams =
            serde_json::from_str(r#"{"codes": [14, 4], "max_attempts": 2}"#).unwrap();
        assert_eq!(params.codes, vec![Code::Unavailable, Code::DeadlineExceeded]);
        assert_eq!(params.max_attempts, 2);
        assert_eq!(params.initial_backoff_ms, 100);
    }

    #[test]
    fn test_method_retry_codes() {
        assert!(get_retry_codes("runQuery").contains(&Code::Internal));
        assert!(get_retry_codes("batchWrite").contains(&Code::Aborted));
        assert!(!get_retry_codes("commit").contains(&Code::Aborted));
        assert!(get_retry_codes("write").is_empty());
        assert!(get_retry_codes("noSuchMethod").is_empty());
        assert_eq!(get_retry_params("listen").codes.len(), 4);
    }

    #[test]
    fn test_backoff_progression() {
        let params = RetryParams::default();
        let mut backoff_ms = params.initial_backoff_ms;
        let mut seen = vec![backoff_ms];
        for _ in 0..3 {
            backoff_ms = params.next_backoff_ms(backoff_ms);
            seen.push(backoff_ms);
        }
        assert_eq!(seen, vec![100, 130, 169, 219]);
    }

    #[test]
    fn test_permanent_error_classification() {
        let unavailable = FiregateError::rpc(Code::Unavailable, "");
        let not_found = FiregateError::rpc(Code::NotFound, "");
        let aborted = FiregateError::rpc(Code::Aborted, "");

        assert!(!is_permanent_rpc_error(&unavailable, "runQuery"));
        assert!(is_permanent_rpc_error(&not_found, "runQuery"));
        assert!(is_permanent_rpc_error(&aborted, "commit"));
        assert!(!is_permanent_rpc_error(&aborted, "batchWrite"));
        assert!(is_permanent_rpc_error(&unavailable, "write"));

        // No backend code: transient
        assert!(!is_permanent_rpc_error(
            &FiregateError::Stream("reset".to_string()),
            "runQuery"
        ));
        assert!(is_permanent_rpc_error(&FiregateError::PoolTerminated, "runQuery"));
    }

    #[tokio::test]
    async fn test_retry_without_params_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_options(None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FiregateError::rpc(Code::Unavailable, "down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let params = get_retry_params("runQuery");
        let calls = AtomicU32::new(0);
        let result = retry_with_options(Some(&params), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(FiregateError::rpc(Code::Unavailable, "down"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable_code() {
        let params = get_retry_params("runQuery");
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_options(Some(&params), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FiregateError::rpc(Code::PermissionDenied, "no")) }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), Code::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let params = RetryParams {
            max_attempts: 3,
            ..get_retry_params("runQuery")
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_options(Some(&params), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FiregateError::Timeout(10)) }
        })
        .await;
        assert!(matches!(result, Err(FiregateError::Timeout(10))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
