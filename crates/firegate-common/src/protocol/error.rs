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

use super::status::{Code, RpcStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FiregateError {
    #[error("The client pool has already been terminated")]
    PoolTerminated,

    #[error("RPC failed with {0}")]
    Rpc(RpcStatus),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("BulkWriter has already been closed")]
    BulkWriterClosed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FiregateError {
    /// Shorthand for an RPC failure with the given code.
    pub fn rpc(code: Code, message: impl Into<String>) -> Self {
        FiregateError::Rpc(RpcStatus::new(code, message))
    }

    /// The status code that best describes this error.
    ///
    /// Only [`FiregateError::Rpc`] carries a backend code; everything else is
    /// mapped onto the code a backend would have reported for the same
    /// condition.
    pub fn code(&self) -> Code {
        match self {
            FiregateError::Rpc(status) => status.code,
            FiregateError::Timeout(_) => Code::DeadlineExceeded,
            FiregateError::Transport(_) => Code::Unavailable,
            FiregateError::InvalidRequest(_) => Code::InvalidArgument,
            FiregateError::PoolTerminated | FiregateError::BulkWriterClosed => {
                Code::FailedPrecondition
            }
            FiregateError::Internal(_) => Code::Internal,
            _ => Code::Unknown,
        }
    }

    /// Returns `true` if the error carries a backend status code.
    pub fn has_rpc_code(&self) -> bool {
        matches!(self, FiregateError::Rpc(_))
    }

    /// Converts the error into a clonable status.
    pub fn to_status(&self) -> RpcStatus {
        match self {
            FiregateError::Rpc(status) => status.clone(),
            other => RpcStatus::new(other.code(), other.to_string()),
        }
    }
}

impl From<RpcStatus> for FiregateError {
    fn from(status: RpcStatus) -> Self {
        FiregateError::Rpc(status)
    }
}

pub type Result<T> = std::result::Result<T, FiregateError>;
