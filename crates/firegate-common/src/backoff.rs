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

//! Exponential backoff with jitter.
//!
//! The first call to [`ExponentialBackoff::backoff_and_wait`] completes
//! immediately. Every following call waits for the current base delay, plus
//! or minus a random jitter, and then grows the base delay by
//! `backoff_factor` up to `max_delay_ms`.
//!
//! # Example
//!
//! ```no_run
//! use firegate_common::backoff::{BackoffConfig, ExponentialBackoff};
//!
//! # async fn example() -> firegate_common::Result<()> {
//! let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
//! backoff.backoff_and_wait().await?; // no delay
//! backoff.backoff_and_wait().await?; // ~1s
//! # Ok(())
//! # }
//! ```

use crate::protocol::error::{FiregateError, Result};
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Upper bound on consecutive waits without a [`ExponentialBackoff::reset`].
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Configuration for [`ExponentialBackoff`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay used for the first retry.
    /// Default: 1000ms
    pub initial_delay_ms: u64,
    /// Multiplier applied to the base delay after every retry.
    /// Default: 1.5
    pub backoff_factor: f64,
    /// Cap on the base delay.
    /// Default: 60000ms
    pub max_delay_ms: u64,
    /// Fraction of the base delay used as jitter range. 0 disables jitter.
    /// Default: 1.0
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            backoff_factor: 1.5,
            max_delay_ms: 60_000,
            jitter_factor: 1.0,
        }
    }
}

/// Produces increasing delays between retry attempts.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_ms: f64,
    retry_count: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_ms: 0.0,
            retry_count: 0,
        }
    }

    /// Resets the delay so the next wait completes immediately.
    pub fn reset(&mut self) {
        self.current_base_ms = 0.0;
        self.retry_count = 0;
    }

    /// Makes the next wait use the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base_ms = self.config.max_delay_ms as f64;
    }

    /// Number of waits since the last reset.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Computes the next delay and advances the backoff state.
    pub fn next_delay(&mut self) -> Result<Duration> {
        if self.retry_count > MAX_RETRY_ATTEMPTS {
            return Err(FiregateError::Internal(
                "Exceeded maximum number of retries allowed".to_string(),
            ));
        }

        let delay_ms = (self.current_base_ms + self.jitter_delay_ms()).max(0.0);
        if self.current_base_ms > 0.0 {
            debug!(
                base_ms = self.current_base_ms,
                delay_ms,
                retry_count = self.retry_count,
                "backing off"
            );
        }

        self.retry_count += 1;
        self.current_base_ms = (self.current_base_ms * self.config.backoff_factor)
            .min(self.config.max_delay_ms as f64)
            .max(self.config.initial_delay_ms as f64);

        Ok(Duration::from_secs_f64(delay_ms / 1000.0))
    }

    /// Waits for the next delay. The first call after construction or
    /// [`reset`](Self::reset) returns immediately.
    pub async fn backoff_and_wait(&mut self) -> Result<()> {
        let delay = self.next_delay()?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn jitter_delay_ms(&self) -> f64 {
        if self.config.jitter_factor <= 0.0 || self.current_base_ms <= 0.0 {
            return 0.0;
        }
        let r: f64 = rand::thread_rng().gen_range(-0.5..0.5);
        r * self.config.jitter_factor * self.current_base_ms
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter_factor: 0.0,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.backoff_factor, 1.5);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.jitter_factor, 1.0);
    }

    #[test]
    fn test_backoff_config_from_json_fills_defaults() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"initial_delay_ms": 10}"#).unwrap();
        assert_eq!(config.initial_delay_ms, 10);
        assert_eq!(config.max_delay_ms, 60_000);
    }

    #[test]
    fn test_first_delay_is_zero() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        assert_eq!(backoff.next_delay().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_exponential_delay_sequence() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let delays: Vec<u128> = (0..5)
            .map(|_| backoff.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![0, 1000, 1500, 2250, 3375]);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            max_delay_ms: 2000,
            ..no_jitter()
        });
        for _ in 0..4 {
            backoff.next_delay().unwrap();
        }
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 2000);
    }

    #[test]
    fn test_reset_and_reset_to_max() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        backoff.reset();
        assert_eq!(backoff.retry_count(), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::ZERO);

        backoff.reset_to_max();
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 60_000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay().unwrap();
        for _ in 0..5 {
            let base = backoff.current_base_ms;
            let delay = backoff.next_delay().unwrap().as_secs_f64() * 1000.0;
            assert!(delay >= base * 0.5 - 1.0 && delay <= base * 1.5 + 1.0);
        }
    }

    #[test]
    fn test_exceeding_max_attempts_fails() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 1,
            ..no_jitter()
        });
        for _ in 0..=MAX_RETRY_ATTEMPTS {
            assert!(backoff.next_delay().is_ok());
        }
        assert!(backoff.next_delay().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_and_wait_sleeps() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let start = tokio::time::Instant::now();
        backoff.backoff_and_wait().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        backoff.backoff_and_wait().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }
}
