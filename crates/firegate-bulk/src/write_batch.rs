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

//! Write batches and the commit primitive behind them.

use async_trait::async_trait;
use firegate_client::{Channel, RpcFacade};
use firegate_common::{
    generate_request_tag, get_retry_codes, Code, DocumentRef, FiregateError, Result, RpcStatus,
    Timestamp, WriteResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// A single mutation of one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Write {
    /// Creates the document; fails if it already exists
    Create { document: DocumentRef, fields: Value },
    /// Overwrites the document, or merges into it when `merge` is set
    Set {
        document: DocumentRef,
        fields: Value,
        merge: bool,
    },
    /// Updates fields of an existing document
    Update { document: DocumentRef, fields: Value },
    Delete { document: DocumentRef },
}

impl Write {
    pub fn document(&self) -> &DocumentRef {
        match self {
            Write::Create { document, .. }
            | Write::Set { document, .. }
            | Write::Update { document, .. }
            | Write::Delete { document } => document,
        }
    }
}

/// The backend's verdict on one write of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Present when the write was applied
    pub write_time: Option<Timestamp>,
    pub status: RpcStatus,
}

impl WriteOutcome {
    pub fn success(write_time: Timestamp) -> Self {
        Self {
            write_time: Some(write_time),
            status: RpcStatus::new(Code::Ok, ""),
        }
    }

    pub fn failure(status: RpcStatus) -> Self {
        Self {
            write_time: None,
            status,
        }
    }

    /// A write time means success; otherwise the write failed with `status`.
    pub fn into_result(self) -> Result<WriteResult> {
        match self.write_time {
            Some(write_time) => Ok(WriteResult::new(write_time)),
            None => Err(FiregateError::Rpc(self.status)),
        }
    }
}

/// Sends a group of writes to the backend without atomicity guarantees.
///
/// Implementations return one outcome per write, in write order.
#[async_trait]
pub trait Committer: Send + Sync {
    async fn commit(&self, writes: Vec<Write>) -> Result<Vec<WriteOutcome>>;
}

/// Accumulates writes for one non-atomic commit.
pub struct WriteBatch {
    writes: Vec<Write>,
    committer: Arc<dyn Committer>,
}

impl WriteBatch {
    pub fn new(committer: Arc<dyn Committer>) -> Self {
        Self {
            writes: Vec::new(),
            committer,
        }
    }

    pub fn create(&mut self, document: DocumentRef, fields: Value) -> &mut Self {
        self.push(Write::Create { document, fields })
    }

    pub fn set(&mut self, document: DocumentRef, fields: Value, merge: bool) -> &mut Self {
        self.push(Write::Set {
            document,
            fields,
            merge,
        })
    }

    pub fn update(&mut self, document: DocumentRef, fields: Value) -> &mut Self {
        self.push(Write::Update { document, fields })
    }

    pub fn delete(&mut self, document: DocumentRef) -> &mut Self {
        self.push(Write::Delete { document })
    }

    pub fn push(&mut self, write: Write) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn op_count(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    /// Commits every accumulated write. Each write succeeds or fails on its
    /// own; the outcomes are returned in write order.
    pub async fn bulk_commit(self) -> Result<Vec<WriteOutcome>> {
        if self.writes.is_empty() {
            return Ok(Vec::new());
        }
        self.committer.commit(self.writes).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchWriteResponse {
    #[serde(default)]
    write_results: Vec<WriteResultEntry>,
    #[serde(default)]
    status: Vec<RpcStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResultEntry {
    #[serde(default)]
    update_time: Option<Timestamp>,
}

/// [`Committer`] issuing `batchWrite` through an [`RpcFacade`].
pub struct RpcCommitter<C: Channel> {
    facade: Arc<RpcFacade<C>>,
}

impl<C: Channel> RpcCommitter<C> {
    pub fn new(facade: Arc<RpcFacade<C>>) -> Self {
        Self { facade }
    }
}

#[async_trait]
impl<C: Channel> Committer for RpcCommitter<C> {
    async fn commit(&self, writes: Vec<Write>) -> Result<Vec<WriteOutcome>> {
        let tag = generate_request_tag();
        let count = writes.len();
        let request = json!({
            "database": self.facade.config().database_resource,
            "writes": writes,
        });

        debug!(request_tag = %tag, count, "Sending batchWrite");
        let response = self
            .facade
            .unary_call("batchWrite", request, &tag, Some(get_retry_codes("batchWrite")))
            .await?;
        let response: BatchWriteResponse = serde_json::from_value(response).map_err(|e| {
            FiregateError::InvalidResponse(format!("Malformed batchWrite response: {}", e))
        })?;
        Ok(decode_outcomes(response))
    }
}

/// Pairs write results with statuses. A missing status means OK; an OK
/// status without an update time is reported as an internal error.
fn decode_outcomes(response: BatchWriteResponse) -> Vec<WriteOutcome> {
    let len = response.write_results.len().max(response.status.len());
    let mut write_results = response.write_results.into_iter();
    let mut statuses = response.status.into_iter();

    (0..len)
        .map(|_| {
            let update_time = write_results.next().and_then(|entry| entry.update_time);
            let status = statuses.next().unwrap_or_else(|| RpcStatus::new(Code::Ok, ""));
            match (status.is_ok(), update_time) {
                (true, Some(time)) => WriteOutcome::success(time),
                (true, None) => WriteOutcome::failure(RpcStatus::new(
                    Code::Internal,
                    "write succeeded without an update time",
                )),
                (false, _) => WriteOutcome::failure(status),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingCommitter {
        received: Mutex<Vec<Vec<Write>>>,
    }

    #[async_trait]
    impl Committer for RecordingCommitter {
        async fn commit(&self, writes: Vec<Write>) -> Result<Vec<WriteOutcome>> {
            let outcomes = writes
                .iter()
                .enumerate()
                .map(|(i, _)| WriteOutcome::success(Timestamp::new(i as i64, 0)))
                .collect();
            self.received.lock().unwrap().push(writes);
            Ok(outcomes)
        }
    }

    #[test]
    fn test_write_serialization() {
        let write = Write::Set {
            document: DocumentRef::new("users/alice"),
            fields: json!({"age": 30}),
            merge: true,
        };
        assert_eq!(
            serde_json::to_value(&write).unwrap(),
            json!({"op": "set", "document": "users/alice", "fields": {"age": 30}, "merge": true})
        );
        assert_eq!(
            serde_json::to_value(Write::Delete { document: "a/b".into() }).unwrap(),
            json!({"op": "delete", "document": "a/b"})
        );
    }

    #[tokio::test]
    async fn test_bulk_commit_sends_writes_in_order() {
        let committer = Arc::new(RecordingCommitter {
            received: Mutex::new(Vec::new()),
        });
        let mut batch = WriteBatch::new(committer.clone());
        batch
            .create("a/1".into(), json!({}))
            .update("a/2".into(), json!({"x": 1}))
            .delete("a/3".into());
        assert_eq!(batch.op_count(), 3);

        let outcomes = batch.bulk_commit().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2].write_time, Some(Timestamp::new(2, 0)));

        let received = committer.received.lock().unwrap();
        let documents: Vec<&str> = received[0].iter().map(|w| w.document().path()).collect();
        assert_eq!(documents, vec!["a/1", "a/2", "a/3"]);
    }

    #[tokio::test]
    async fn test_empty_batch_commits_nothing() {
        let committer = Arc::new(RecordingCommitter {
            received: Mutex::new(Vec::new()),
        });
        let outcomes = WriteBatch::new(committer.clone()).bulk_commit().await.unwrap();
        assert!(outcomes.is_empty());
        assert!(committer.received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = WriteOutcome::success(Timestamp::new(5, 1)).into_result().unwrap();
        assert_eq!(ok.write_time, Timestamp::new(5, 1));

        let err = WriteOutcome::failure(RpcStatus::new(Code::AlreadyExists, "exists"))
            .into_result()
            .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[test]
    fn test_decode_batch_write_response() {
        let response: BatchWriteResponse = serde_json::from_value(json!({
            "writeResults": [
                {"updateTime": {"seconds": 10, "nanos": 0}},
                {},
                {}
            ],
            "status": [
                {"code": 0},
                {"code": 6, "message": "already exists"},
                {"code": 0}
            ]
        }))
        .unwrap();

        let outcomes = decode_outcomes(response);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].write_time, Some(Timestamp::new(10, 0)));
        assert_eq!(outcomes[1].status.code, Code::AlreadyExists);
        assert_eq!(outcomes[1].write_time, None);
        assert_eq!(outcomes[2].status.code, Code::Internal);
    }

    #[test]
    fn test_decode_without_statuses() {
        let response: BatchWriteResponse = serde_json::from_value(json!({
            "writeResults": [{"updateTime": {"seconds": 1}}]
        }))
        .unwrap();
        let outcomes = decode_outcomes(response);
        assert!(outcomes[0].status.is_ok());
        assert_eq!(outcomes[0].write_time, Some(Timestamp::new(1, 0)));
    }
}
