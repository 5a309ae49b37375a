//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Exponential-backoff retry decision, shared between the managed socket's
//! reconnect policy and the client core's optional per-chunk write retry.

use crate::error::FluentError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked once per failed attempt, before the policy decides
/// whether to retry or give up. Mirrors `eventRetry.onError(err, attempt)`.
pub type OnRetryError = Arc<dyn Fn(&FluentError, u32) + Send + Sync>;

/// Parameters for an exponential-backoff-with-jitter schedule.
#[derive(Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay to randomize, in `[0, 1]`.
    pub jitter: f64,
    pub max_attempts: Option<u32>,
    /// Invoked with the failed attempt's error and its 1-based attempt
    /// number. Only consulted by the client core's per-chunk write retry;
    /// the managed socket's reconnect loop never sets this.
    pub on_error: Option<OnRetryError>,
}

impl fmt::Debug for BackoffConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffConfig")
            .field("initial", &self.initial)
            .field("max", &self.max)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("max_attempts", &self.max_attempts)
            .field("on_error", &self.on_error.as_ref().map(|_| "Fn(..)"))
            .finish()
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
            on_error: None,
        }
    }
}

/// The outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// A stateless policy: given an attempt count (1-based, the attempt that
/// just failed), decide whether and how long to wait before the next try.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Run the configured `on_error` callback, if any, for one failed
    /// attempt. A no-op when no callback was configured.
    pub fn notify_error(&self, err: &FluentError, attempt: u32) {
        if let Some(on_error) = &self.config.on_error {
            on_error(err, attempt);
        }
    }

    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if let Some(max) = self.config.max_attempts {
            if attempt >= max {
                return RetryDecision::GiveUp;
            }
        }

        let base = self.config.initial.as_secs_f64() * self.config.multiplier.powi(attempt as i32 - 1);
        let base = base.min(self.config.max.as_secs_f64());

        let jitter_span = base * self.config.jitter;
        let jittered = if jitter_span > 0.0 {
            rand::thread_rng().gen_range((base - jitter_span).max(0.0)..=(base + jitter_span))
        } else {
            base
        };

        RetryDecision::RetryAfter(Duration::from_secs_f64(jittered.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(BackoffConfig {
            max_attempts: Some(3),
            ..Default::default()
        });
        assert!(matches!(policy.decide(1), RetryDecision::RetryAfter(_)));
        assert!(matches!(policy.decide(2), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(10), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = RetryPolicy::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 10.0,
            jitter: 0.0,
            max_attempts: None,
            on_error: None,
        });
        match policy.decide(10) {
            RetryDecision::RetryAfter(d) => assert!(d <= Duration::from_millis(500)),
            RetryDecision::GiveUp => panic!("should not give up without max_attempts"),
        }
    }

    #[test]
    fn unlimited_attempts_never_give_up() {
        let policy = RetryPolicy::new(BackoffConfig::default());
        for attempt in 1..100 {
            assert!(matches!(policy.decide(attempt), RetryDecision::RetryAfter(_)));
        }
    }
}
