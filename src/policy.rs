// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recurring Policies
//!
//! A [`RecurringPolicy`] bounds how often and for how long a failed operation
//! is attempted again. The same shape is used for invocation retries
//! ([`RetryPolicy`]) and for connection and channel recovery ([`RecoveryPolicy`]).
//!
//! ```
//! use rabbitmq_recovery::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(5)
//!     .with_backoff(Duration::from_millis(100), Duration::from_secs(5))
//!     .unwrap();
//! assert!(policy.allows_attempts());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Attempt count meaning "no limit".
pub const INFINITE_ATTEMPTS: i32 = -1;

const DEFAULT_MULTIPLIER: u32 = 2;

/// Errors raised while building a policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("interval must be greater than zero")]
    NonPositiveInterval,

    #[error("interval {interval:?} must be less than max interval {max_interval:?}")]
    IntervalNotBelowMax {
        interval: Duration,
        max_interval: Duration,
    },

    #[error("interval multiplier must be greater than 1, got {0}")]
    MultiplierTooSmall(u32),

    #[error("backoff has already been configured")]
    BackoffAlreadySet,

    #[error("max attempts must be -1 or greater, got {0}")]
    InvalidMaxAttempts(i32),
}

/// Bounds for a sequence of attempts: a count, a total duration and the wait
/// between attempts, either fixed or growing by a multiplier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringPolicy {
    pub(crate) max_attempts: i32,
    pub(crate) max_duration: Option<Duration>,
    pub(crate) interval: Option<Duration>,
    pub(crate) max_interval: Option<Duration>,
    pub(crate) interval_multiplier: u32,
}

/// Policy applied to failed invocations.
pub type RetryPolicy = RecurringPolicy;

/// Policy applied to connection and channel recovery.
pub type RecoveryPolicy = RecurringPolicy;

impl Default for RecurringPolicy {
    fn default() -> Self {
        RecurringPolicy {
            max_attempts: INFINITE_ATTEMPTS,
            max_duration: None,
            interval: None,
            max_interval: None,
            interval_multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RecurringPolicy {
    /// Unlimited attempts, no wait between them.
    pub fn new() -> RecurringPolicy {
        RecurringPolicy::default()
    }

    /// Always attempt again.
    pub fn always() -> RecurringPolicy {
        RecurringPolicy::default()
    }

    /// Never attempt again.
    pub fn never() -> RecurringPolicy {
        RecurringPolicy::default().with_max_attempts(0)
    }

    /// Sets the maximum number of additional attempts. `-1` means unlimited.
    ///
    /// Values below `-1` are treated as unlimited.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(INFINITE_ATTEMPTS);
        self
    }

    /// Sets the total time budget measured from the first failure.
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Sets a fixed wait between attempts.
    ///
    /// # Errors
    ///
    /// Fails when a backoff was configured before.
    pub fn with_interval(mut self, interval: Duration) -> Result<Self, PolicyError> {
        if self.max_interval.is_some() {
            return Err(PolicyError::BackoffAlreadySet);
        }
        self.interval = Some(interval);
        Ok(self)
    }

    /// Sets an exponential backoff doubling the wait on every attempt.
    pub fn with_backoff(
        self,
        interval: Duration,
        max_interval: Duration,
    ) -> Result<Self, PolicyError> {
        self.with_backoff_multiplier(interval, max_interval, DEFAULT_MULTIPLIER)
    }

    /// Sets an exponential backoff.
    ///
    /// # Parameters
    ///
    /// * `interval` - The first wait, must be positive
    /// * `max_interval` - Upper bound of the wait, must be greater than `interval`
    /// * `multiplier` - Growth factor applied per attempt, must be greater than 1
    pub fn with_backoff_multiplier(
        mut self,
        interval: Duration,
        max_interval: Duration,
        multiplier: u32,
    ) -> Result<Self, PolicyError> {
        if interval.is_zero() {
            return Err(PolicyError::NonPositiveInterval);
        }
        if interval >= max_interval {
            return Err(PolicyError::IntervalNotBelowMax {
                interval,
                max_interval,
            });
        }
        if multiplier <= 1 {
            return Err(PolicyError::MultiplierTooSmall(multiplier));
        }

        self.interval = Some(interval);
        self.max_interval = Some(max_interval);
        self.interval_multiplier = multiplier;
        Ok(self)
    }

    /// Returns whether the policy permits any attempt beyond the first.
    pub fn allows_attempts(&self) -> bool {
        self.max_attempts != 0 && self.max_duration.map_or(true, |d| !d.is_zero())
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval
    }

    pub fn interval_multiplier(&self) -> u32 {
        self.interval_multiplier
    }

    pub fn has_backoff(&self) -> bool {
        self.max_interval.is_some()
    }
}
