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

//! Adaptive token bucket for bulk write dispatch.
//!
//! The bucket starts at `initial_ops_per_second` and grows its capacity by
//! 50% every five minutes until `max_ops_per_second` is reached (the
//! "500/50/5" ramp-up rule). Tokens refill continuously at the current
//! capacity per second and never exceed one second worth of capacity.
//!
//! # Example
//!
//! ```
//! use firegate_bulk::rate_limiter::RateLimiter;
//! use tokio::time::Instant;
//!
//! let start = Instant::now();
//! let mut limiter = RateLimiter::new(500.0, 1.5, 5 * 60 * 1000, 10_000.0, start);
//! assert!(limiter.try_make_request(500, start));
//! assert!(!limiter.try_make_request(1, start));
//! ```

use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Capacity growth factor applied every [`RATE_LIMITER_MULTIPLIER_MILLIS`].
pub const RATE_LIMITER_MULTIPLIER: f64 = 1.5;

/// Five minutes.
pub const RATE_LIMITER_MULTIPLIER_MILLIS: u64 = 5 * 60 * 1000;

/// Throttling applied to [`BulkWriter`](crate::BulkWriter) dispatch.
///
/// # Default Configuration
///
/// Enabled with 500 initial and 10000 maximum operations per second.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlingConfig {
    Disabled,
    Enabled {
        initial_ops_per_second: f64,
        max_ops_per_second: f64,
    },
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        ThrottlingConfig::Enabled {
            initial_ops_per_second: 500.0,
            max_ops_per_second: 10_000.0,
        }
    }
}

/// Token bucket whose capacity grows over time.
#[derive(Debug)]
pub struct RateLimiter {
    initial_capacity: f64,
    multiplier: f64,
    multiplier_millis: u64,
    maximum_capacity: f64,
    start: Instant,
    available_tokens: f64,
    last_refill: Instant,
    previous_capacity: f64,
}

impl RateLimiter {
    pub fn new(
        initial_capacity: f64,
        multiplier: f64,
        multiplier_millis: u64,
        maximum_capacity: f64,
        start: Instant,
    ) -> Self {
        let initial_capacity = initial_capacity.max(1.0);
        Self {
            initial_capacity,
            multiplier,
            multiplier_millis: multiplier_millis.max(1),
            maximum_capacity: maximum_capacity.max(initial_capacity),
            start,
            available_tokens: initial_capacity,
            last_refill: start,
            previous_capacity: initial_capacity,
        }
    }

    /// Builds the limiter for `config`, or `None` when throttling is disabled.
    pub fn from_config(config: &ThrottlingConfig, start: Instant) -> Option<Self> {
        match config {
            ThrottlingConfig::Disabled => None,
            ThrottlingConfig::Enabled {
                initial_ops_per_second,
                max_ops_per_second,
            } => Some(Self::new(
                *initial_ops_per_second,
                RATE_LIMITER_MULTIPLIER,
                RATE_LIMITER_MULTIPLIER_MILLIS,
                *max_ops_per_second,
                start,
            )),
        }
    }

    /// Takes `num_operations` tokens if they are available.
    pub fn try_make_request(&mut self, num_operations: usize, now: Instant) -> bool {
        self.refill_tokens(now);
        let requested = num_operations as f64;
        if requested <= self.available_tokens {
            self.available_tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Time until `num_operations` tokens will be available. Requests larger
    /// than the current capacity are treated as a request for the full
    /// capacity, so the delay is always finite.
    pub fn next_request_delay(&mut self, num_operations: usize, now: Instant) -> Duration {
        self.refill_tokens(now);
        let capacity = self.calculate_capacity(now);
        let requested = (num_operations as f64).min(capacity);
        if requested <= self.available_tokens {
            return Duration::ZERO;
        }
        let missing = requested - self.available_tokens;
        Duration::from_millis((missing * 1000.0 / capacity).ceil() as u64)
    }

    /// Current capacity in operations per second.
    pub fn calculate_capacity(&mut self, now: Instant) -> f64 {
        let elapsed_ms = now.saturating_duration_since(self.start).as_millis() as u64;
        let periods = (elapsed_ms / self.multiplier_millis) as i32;
        let capacity = (self.initial_capacity * self.multiplier.powi(periods))
            .floor()
            .min(self.maximum_capacity);
        if capacity > self.previous_capacity {
            debug!(capacity, "Bulk write rate limit raised");
            self.previous_capacity = capacity;
        }
        capacity
    }

    pub fn initial_capacity(&self) -> f64 {
        self.initial_capacity
    }

    pub fn available_tokens(&self) -> f64 {
        self.available_tokens
    }

    fn refill_tokens(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let capacity = self.calculate_capacity(now);
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let new_tokens = elapsed * capacity;
        if new_tokens >= 1.0 {
            self.available_tokens = (self.available_tokens + new_tokens).min(capacity);
            self.last_refill = now;
        }
    }
}
