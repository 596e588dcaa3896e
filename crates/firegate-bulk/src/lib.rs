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

//! Firegate Bulk Writes
//!
//! High-volume, non-atomic writes on top of the firegate RPC facade:
//!
//! - [`WriteBatch`] accumulates writes and commits them through a
//!   [`Committer`]; [`RpcCommitter`] issues `batchWrite` calls
//! - [`BulkWriter`] batches writes, keeps writes to one document apart and
//!   dispatches batches in order under an adaptive [`RateLimiter`]

pub mod bulk_writer;
pub mod rate_limiter;
pub mod write_batch;

pub use bulk_writer::{BulkWriter, BulkWriterOptions, PendingWrite, DEFAULT_MAX_BATCH_SIZE};
pub use rate_limiter::{RateLimiter, ThrottlingConfig};
pub use write_batch::{Committer, RpcCommitter, Write, WriteBatch, WriteOutcome};
