// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-definition retry and transition policy.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Retry and transition timing for one workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Failed attempts allowed in one state before failure routing kicks in.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub min_error_transition_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_error_transition_delay: Duration,
    /// Delay forced when the busy-loop breaker fires.
    pub short_transition_delay: Duration,
    /// Delay added to transitions that asked to run immediately.
    pub immediate_transition_delay: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_retries: 17,
            min_error_transition_delay: Duration::from_secs(60),
            max_error_transition_delay: Duration::from_secs(24 * 3600),
            short_transition_delay: Duration::from_secs(30),
            immediate_transition_delay: Duration::ZERO,
        }
    }
}

impl WorkflowSettings {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn error_transition_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_error_transition_delay = min;
        self.max_error_transition_delay = max;
        self
    }

    pub fn short_transition_delay(mut self, delay: Duration) -> Self {
        self.short_transition_delay = delay;
        self
    }

    pub fn immediate_transition_delay(mut self, delay: Duration) -> Self {
        self.immediate_transition_delay = delay;
        self
    }

    /// Check that the delay bounds are consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_error_transition_delay > self.max_error_transition_delay {
            return Err(format!(
                "min_error_transition_delay ({:?}) exceeds max_error_transition_delay ({:?})",
                self.min_error_transition_delay, self.max_error_transition_delay
            ));
        }
        Ok(())
    }

    /// Retry delay after `retries` failed attempts.
    ///
    /// Doubles from the minimum on every retry and saturates at the maximum,
    /// so it is non-decreasing in `retries` and never overflows.
    pub fn error_transition_delay(&self, retries: u32) -> Duration {
        let max = self.max_error_transition_delay;
        1u32.checked_shl(retries)
            .and_then(|factor| self.min_error_transition_delay.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }

    /// Activation time for the next retry after `retries` failed attempts.
    pub fn error_transition_activation(&self, retries: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        add_saturating(now, self.error_transition_delay(retries))
    }

    /// Activation time forced by the busy-loop breaker.
    pub fn short_transition_activation(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add_saturating(now, self.short_transition_delay)
    }
}

/// `at + delay`, clamped to the largest representable timestamp.
pub(crate) fn add_saturating(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
