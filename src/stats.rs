// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recurring Stats
//!
//! Mutable bookkeeping for one sequence of retry or recovery attempts under a
//! [`RecurringPolicy`]. A fresh instance is created for every sequence.

use crate::policy::{RecurringPolicy, INFINITE_ATTEMPTS};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RecurringStats {
    max_attempts: i32,
    max_duration: Option<Duration>,
    backoff: Option<(u32, Duration)>,
    started_at: Instant,
    incremented: bool,
    attempt_count: u32,
    wait_time: Duration,
    max_wait_time: Option<Duration>,
}

/// Stats of a retried invocation.
pub type RetryStats = RecurringStats;

impl RecurringStats {
    /// Starts a new sequence of attempts at the current instant.
    pub fn new(policy: &RecurringPolicy) -> RecurringStats {
        let interval = policy.interval.unwrap_or(Duration::ZERO);
        let wait_time = match policy.max_duration {
            Some(max_duration) => interval.min(max_duration),
            None => interval,
        };
        let backoff = policy
            .max_interval
            .map(|max_interval| (policy.interval_multiplier, max_interval));

        RecurringStats {
            max_attempts: policy.max_attempts,
            max_duration: policy.max_duration,
            backoff,
            started_at: Instant::now(),
            incremented: false,
            attempt_count: 0,
            wait_time,
            max_wait_time: policy.max_duration,
        }
    }

    /// Records one more attempt and updates the wait times.
    pub fn increment_attempts(&mut self) {
        self.attempt_count += 1;
        self.increment_time();
    }

    /// Updates the wait time for the next attempt.
    ///
    /// The first call keeps the configured interval; later calls grow it by
    /// the backoff multiplier up to the max interval. With a max duration the
    /// wait never goes past the remaining budget.
    pub fn increment_time(&mut self) {
        if !self.incremented {
            self.incremented = true;
        } else if let Some((multiplier, max_interval)) = self.backoff {
            self.wait_time = self.wait_time.saturating_mul(multiplier).min(max_interval);
        }

        if let Some(max_duration) = self.max_duration {
            let remaining = max_duration.saturating_sub(self.started_at.elapsed());
            self.wait_time = self.wait_time.min(remaining);
            self.max_wait_time = Some(remaining);
        }
    }

    /// Returns whether the attempt count or the time budget is used up.
    pub fn is_policy_exceeded(&self) -> bool {
        let attempts_exceeded = self.max_attempts != INFINITE_ATTEMPTS
            && i64::from(self.attempt_count) >= i64::from(self.max_attempts);
        let duration_exceeded = self
            .max_duration
            .is_some_and(|max_duration| self.started_at.elapsed() >= max_duration);
        attempts_exceeded || duration_exceeded
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Wait before the next attempt.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Longest permitted wait for a resource to become available, `None` when unbounded.
    pub fn max_wait_time(&self) -> Option<Duration> {
        self.max_wait_time
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
