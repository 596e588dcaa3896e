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

//! Firegate Common Types
//!
//! This crate provides the types shared by the firegate client crates:
//!
//! - **Protocol Layer**: status codes, the crate-wide error type, document
//!   references and write results
//! - **Retry Layer**: per-method retry parameters, the permanent-error
//!   classifier and the unary retry driver
//! - **Backoff**: jittered exponential backoff used between stream attempts
//!
//! # Components
//!
//! - [`protocol`] - Core protocol types (`Code`, `RpcStatus`, `FiregateError`, `DocumentRef`)
//! - [`retry`] - Retry tables and [`retry::retry_with_options`]
//! - [`backoff`] - [`backoff::ExponentialBackoff`]
//!
//! # Example
//!
//! ```
//! use firegate_common::{is_permanent_rpc_error, Code, FiregateError};
//!
//! let err = FiregateError::rpc(Code::Unavailable, "backend restarting");
//! assert!(!is_permanent_rpc_error(&err, "runQuery"));
//! ```

pub mod backoff;
pub mod protocol;
pub mod retry;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use protocol::*;
pub use retry::{get_retry_codes, get_retry_params, is_permanent_rpc_error, retry_with_options, RetryParams};
