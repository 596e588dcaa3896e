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

//! Document and message types shared by the facade and the bulk writer.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type MethodName = String;

/// An opaque request or response message. The wire encoding is owned by the
/// channel implementation; the facade only moves these around.
pub type RpcMessage = serde_json::Value;

/// Length of generated request tags.
const REQUEST_TAG_LEN: usize = 5;

/// Generates a short random tag used to correlate log lines of one logical
/// request across retries.
pub fn generate_request_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_TAG_LEN)
        .map(char::from)
        .collect()
}

/// Reference to a single document, identified by its resource path
/// (e.g. `"users/alice"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef {
    path: String,
}

impl DocumentRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl From<&str> for DocumentRef {
    fn from(path: &str) -> Self {
        DocumentRef::new(path)
    }
}

impl From<String> for DocumentRef {
    fn from(path: String) -> Self {
        DocumentRef::new(path)
    }
}

/// A backend commit timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    #[serde(default)]
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }
}

/// Result of a single successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub write_time: Timestamp,
}

impl WriteResult {
    pub fn new(write_time: Timestamp) -> Self {
        Self { write_time }
    }
}
