// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capped, jittered exponential backoff shared by report retries and the export poller.

use std::time::Duration;

/// Configuration parameters for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any single delay (before jitter).
    pub max_backoff: Duration,
    /// Multiplier applied per consecutive failure.
    pub factor: f64,
    /// Fraction of the delay randomised in either direction, in `[0, 1]`.
    pub jitter: f64,
}

impl BackoffConfig {
    /// Policy for ordinary report fetches.
    pub fn report_retry() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Longer policy used by the export poller when the sending platform rate limits.
    pub fn export_rate_limit() -> Self {
        Self {
            base: Duration::from_secs(30),
            max_backoff: Duration::from_secs(10 * 60),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    pub fn without_jitter(self) -> Self {
        Self { jitter: 0.0, ..self }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::report_retry()
    }
}

/// Tracks consecutive failures and computes the next delay.
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    error_count: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Registers a failure and returns the delay before the next attempt.
    pub fn register_error(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        // Past 2^32 the cap has long been reached.
        let exponent = (self.error_count - 1).min(32) as i32;
        let raw = self.config.base.as_secs_f64() * self.config.factor.powi(exponent);
        let capped = raw.min(self.config.max_backoff.as_secs_f64());
        Duration::from_secs_f64(apply_jitter(capped, self.config.jitter))
    }

    pub fn register_success(&mut self) {
        self.error_count = 0;
    }
}

fn apply_jitter(secs: f64, jitter: f64) -> f64 {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return secs;
    }
    // Uniform in [1 - jitter, 1 + jitter).
    let factor = 1.0 - jitter + 2.0 * jitter * fastrand::f64();
    (secs * factor).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_cap() {
        let mut state = BackoffState::new(BackoffConfig {
            base: Duration::from_secs(30),
            max_backoff: Duration::from_secs(120),
            factor: 2.0,
            jitter: 0.0,
        });
        assert_eq!(state.register_error(), Duration::from_secs(30));
        assert_eq!(state.register_error(), Duration::from_secs(60));
        assert_eq!(state.register_error(), Duration::from_secs(120));
        assert_eq!(state.register_error(), Duration::from_secs(120));
        assert_eq!(state.error_count(), 4);

        state.register_success();
        assert_eq!(state.register_error(), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = BackoffConfig {
            base: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.5,
        };
        for _ in 0..200 {
            let mut state = BackoffState::new(config);
            let delay = state.register_error();
            assert!(delay >= Duration::from_secs(5), "{delay:?} below jitter floor");
            assert!(delay <= Duration::from_secs(15), "{delay:?} above jitter ceiling");
        }
    }

    #[test]
    fn many_failures_do_not_overflow() {
        let mut state = BackoffState::new(BackoffConfig::export_rate_limit().without_jitter());
        for _ in 0..1_000 {
            state.register_error();
        }
        assert_eq!(state.register_error(), Duration::from_secs(600));
    }
}
