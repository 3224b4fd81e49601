// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Loop
//!
//! [`RetryableResource`] holds the availability state shared by the
//! recovering connection and channel handlers and runs operations against
//! them with retries. A failed operation is classified by its shutdown signal:
//!
//! - a channel closure triggers channel recovery from the calling task,
//! - a connection closure waits for the connection recovery running in the
//!   background,
//!
//! and the operation is attempted again while the policy allows it. Once
//! recovery gives up, the failure is recorded on the resource and every
//! caller that would wait for recovery gets that failure instead.

use crate::{
    circuit::Circuit,
    client::ShutdownListener,
    errors::{AmqpError, ShutdownSignal},
    listeners::ListenerSet,
    policy::RecurringPolicy,
    stats::RecurringStats,
    waiter::InterruptibleWaiter,
};
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};
use tokio::time::Instant;
use tracing::debug;

/// The resource-specific part of the retry loop.
#[async_trait]
pub(crate) trait Recoverable: Send + Sync {
    /// Returns whether the resource recovers from a closure of the given kind.
    fn can_recover(&self, connection_closed: bool) -> bool;

    /// Reacts to a shutdown seen by a failed operation.
    fn shutdown_observed(&self, signal: &ShutdownSignal);

    /// Recovers the channel from the calling task.
    ///
    /// # Returns
    /// `Ok(true)` once the channel is usable again, `Ok(false)` if it could not be recovered
    async fn recover_channel(&self) -> Result<bool, AmqpError> {
        Ok(false)
    }
}

/// Availability, closure and retry state of a recovering resource.
#[derive(Debug, Default)]
pub(crate) struct RetryableResource {
    pub(crate) circuit: Circuit,
    pub(crate) retry_waiter: InterruptibleWaiter,
    pub(crate) shutdown_listeners: ListenerSet<dyn ShutdownListener>,
    unavailable: AtomicBool,
    closed: AtomicBool,
    failure: Mutex<Option<AmqpError>>,
}

impl RetryableResource {
    pub(crate) fn new() -> RetryableResource {
        RetryableResource::default()
    }

    #[cfg(test)]
    pub(crate) fn with_waiter(retry_waiter: InterruptibleWaiter) -> RetryableResource {
        RetryableResource {
            retry_waiter,
            ..RetryableResource::default()
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_available(&self) -> bool {
        self.circuit.is_closed()
    }

    /// Opens the circuit once per outage.
    pub(crate) fn mark_unavailable(&self) -> bool {
        let transitioned = !self.unavailable.swap(true, Ordering::SeqCst);
        if transitioned {
            self.circuit.open();
        }
        transitioned
    }

    /// Closes the circuit if it was opened by [`RetryableResource::mark_unavailable`].
    pub(crate) fn mark_available(&self) -> bool {
        self.lock_failure().take();
        let transitioned = self.unavailable.swap(false, Ordering::SeqCst);
        if transitioned {
            self.circuit.close();
        }
        transitioned
    }

    /// Closes the resource for good and wakes every waiting task.
    ///
    /// # Returns
    /// `false` if the resource was already closed
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.circuit.open();
        self.interrupt_waiters();
        true
    }

    pub(crate) fn interrupt_waiters(&self) {
        self.circuit.interrupt_waiters();
        self.retry_waiter.interrupt_waiters();
    }

    fn lock_failure(&self) -> MutexGuard<'_, Option<AmqpError>> {
        self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records that recovery gave up and wakes every waiting task.
    ///
    /// The failure is handed to every later caller that would otherwise wait
    /// for recovery, until the resource becomes available again.
    pub(crate) fn fail(&self, failure: AmqpError) {
        *self.lock_failure() = Some(failure);
        self.interrupt_waiters();
    }

    pub(crate) fn recovery_failure(&self) -> Option<AmqpError> {
        self.lock_failure().clone()
    }

    /// Waits for the circuit to close, bounded by the stats' remaining time.
    ///
    /// # Returns
    /// `true` if the resource became available, `false` on timeout, interruption
    /// or when recovery already gave up
    pub(crate) async fn await_circuit(&self, stats: &RecurringStats) -> bool {
        let waiting = self.circuit.register();
        if self.recovery_failure().is_some() {
            return false;
        }
        match stats.max_wait_time() {
            Some(timeout) => matches!(waiting.wait_timeout(timeout).await, Ok(true)),
            None => waiting.wait().await.is_ok(),
        }
    }

    /// The recorded recovery failure, or `err` while recovery has not given up.
    fn failed_with(&self, err: AmqpError) -> AmqpError {
        self.recovery_failure().unwrap_or(err)
    }

    /// Runs `operation`, retrying it under `policy`.
    ///
    /// # Parameters
    /// * `resource` - The handler the operation runs against
    /// * `label` - Operation name used in logs
    /// * `policy` - Bounds the retries
    /// * `recovery` - Stats of the enclosing recovery when the operation is a recovery step.
    ///   A recovery step never waits for the circuit and fails fast on connection closures.
    /// * `operation` - Produces one attempt
    ///
    /// # Returns
    /// The operation's result, or the error of the last attempt
    pub(crate) async fn call_with_retries<T, F, Fut>(
        &self,
        resource: &dyn Recoverable,
        label: &str,
        policy: &RecurringPolicy,
        mut recovery: Option<&mut RecurringStats>,
        mut operation: F,
    ) -> Result<T, AmqpError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, AmqpError>> + Send,
        T: Send,
    {
        let recovering = recovery.is_some();
        let mut retry_stats: Option<RecurringStats> = None;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let signal = err.shutdown_signal().cloned();
            if let Some(signal) = &signal {
                if signal.initiated_by_application {
                    return Err(err);
                }
                resource.shutdown_observed(signal);
                if (recovering && signal.hard) || !resource.can_recover(signal.hard) {
                    return Err(err);
                }
            }
            if self.is_closed() {
                return Err(err);
            }

            let started = Instant::now();
            let stats = match recovery.as_deref_mut() {
                Some(stats) => stats,
                None => retry_stats.get_or_insert_with(|| RecurringStats::new(policy)),
            };

            if !recovering {
                match &signal {
                    Some(signal) if !signal.hard => match resource.recover_channel().await {
                        Ok(true) => {}
                        Ok(false) => return Err(err),
                        Err(failure) if failure.is_connection_closure() => {
                            if !self.await_circuit(stats).await {
                                return Err(self.failed_with(err));
                            }
                        }
                        Err(_) => return Err(err),
                    },
                    Some(_) => {
                        if !self.await_circuit(stats).await {
                            debug!(operation = label, "resource not recovered in time");
                            return Err(self.failed_with(err));
                        }
                    }
                    None => {}
                }
            }

            let retryable =
                !err.is_authentication_failure() && (err.is_retryable() || recovering);
            if !retryable || !policy.allows_attempts() || stats.is_policy_exceeded() {
                return Err(err);
            }

            stats.increment_attempts();
            let wait = stats.wait_time().saturating_sub(started.elapsed());
            debug!(
                operation = label,
                attempt = stats.attempt_count(),
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                error = err.to_string(),
                "retrying"
            );
            if !wait.is_zero() && !self.retry_waiter.sleep(wait).await {
                return Err(err);
            }
            if self.is_closed() {
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::tests::TrackingSleeper;
    use std::{
        collections::VecDeque,
        sync::{atomic::AtomicUsize, Arc, Mutex},
        time::Duration,
    };

    #[derive(Default)]
    struct Stub {
        recoverable: bool,
        recover_result: Mutex<VecDeque<Result<bool, AmqpError>>>,
        observed: Mutex<Vec<ShutdownSignal>>,
        recoveries: AtomicUsize,
    }

    #[async_trait]
    impl Recoverable for Stub {
        fn can_recover(&self, _connection_closed: bool) -> bool {
            self.recoverable
        }

        fn shutdown_observed(&self, signal: &ShutdownSignal) {
            self.observed.lock().unwrap().push(signal.clone());
        }

        async fn recover_channel(&self) -> Result<bool, AmqpError> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            self.recover_result
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(true))
        }
    }

    fn recoverable() -> Stub {
        Stub {
            recoverable: true,
            ..Stub::default()
        }
    }

    struct Script {
        failures: Mutex<VecDeque<AmqpError>>,
        calls: AtomicUsize,
    }

    impl Script {
        fn new(failures: Vec<AmqpError>) -> Script {
            Script {
                failures: Mutex::new(failures.into()),
                calls: AtomicUsize::new(0),
            }
        }

        async fn run(&self) -> Result<usize, AmqpError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(call),
            }
        }
    }

    fn soft(code: u16) -> AmqpError {
        AmqpError::Shutdown(ShutdownSignal::channel(code, "closed"))
    }

    fn hard(code: u16) -> AmqpError {
        AmqpError::Shutdown(ShutdownSignal::connection(code, "closed"))
    }

    fn policy(attempts: i32, interval_ms: u64) -> RecurringPolicy {
        RecurringPolicy::new()
            .with_max_attempts(attempts)
            .with_interval(Duration::from_millis(interval_ms))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn soft_closure_then_timeout_then_success() {
        let resource = RetryableResource::new();
        let stub = recoverable();
        let script = Script::new(vec![soft(311), AmqpError::Timeout]);
        let started = Instant::now();

        let result = resource
            .call_with_retries(&stub, "publish", &policy(3, 10), None, || script.run())
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(stub.recoveries.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_follow_the_backoff() {
        let sleeper = TrackingSleeper::default();
        let resource = RetryableResource::with_waiter(InterruptibleWaiter::new(Arc::new(
            sleeper.clone(),
        )));
        let stub = recoverable();
        let script = Script::new(vec![AmqpError::Timeout; 4]);
        let policy = RecurringPolicy::new()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .unwrap();

        let result = resource
            .call_with_retries(&stub, "declare", &policy, None, || script.run())
            .await;

        assert_eq!(result, Ok(5));
        assert_eq!(
            sleeper.calls(),
            [1, 2, 4, 5].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_bounds_retries() {
        let resource = RetryableResource::new();
        let stub = recoverable();
        let script = Script::new(vec![AmqpError::Timeout; 10]);

        let result = resource
            .call_with_retries(&stub, "ack", &policy(2, 1), None, || script.run())
            .await;

        assert_eq!(result, Err(AmqpError::Timeout));
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_are_not_retried() {
        let resource = RetryableResource::new();
        let stub = recoverable();
        let script = Script::new(vec![AmqpError::AuthenticationFailure("refused".into())]);

        let result = resource
            .call_with_retries(&stub, "connect", &policy(5, 1), None, || script.run())
            .await;

        assert!(matches!(result, Err(AmqpError::AuthenticationFailure(_))));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_channel_closure_recovers_but_fails() {
        let resource = RetryableResource::new();
        let stub = recoverable();
        let script = Script::new(vec![soft(404)]);

        let result = resource
            .call_with_retries(&stub, "queue.declare", &policy(5, 1), None, || script.run())
            .await;

        assert_eq!(result, Err(soft(404)));
        assert_eq!(stub.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(stub.observed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecovered_channel_fails_the_call() {
        let resource = RetryableResource::new();
        let stub = recoverable();
        stub.recover_result.lock().unwrap().push_back(Ok(false));
        let script = Script::new(vec![soft(311)]);

        let result = resource
            .call_with_retries(&stub, "publish", &policy(5, 1), None, || script.run())
            .await;

        assert_eq!(result, Err(soft(311)));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_resource_fails_immediately() {
        let resource = RetryableResource::new();
        let stub = Stub::default();
        let script = Script::new(vec![hard(320)]);

        let result = resource
            .call_with_retries(&stub, "publish", &policy(5, 1), None, || script.run())
            .await;

        assert_eq!(result, Err(hard(320)));
        assert_eq!(stub.observed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_closure_waits_for_recovery() {
        let resource = Arc::new(RetryableResource::new());
        resource.mark_unavailable();

        let recovered = resource.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            recovered.mark_available();
        });

        let stub = recoverable();
        let script = Script::new(vec![hard(320)]);
        let started = Instant::now();
        let result = resource
            .call_with_retries(&stub, "publish", &policy(1, 0), None, || script.run())
            .await;

        assert_eq!(result, Ok(2));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_wait_is_bounded_by_max_duration() {
        let resource = RetryableResource::new();
        resource.mark_unavailable();
        let stub = recoverable();
        let script = Script::new(vec![hard(320)]);
        let policy = RecurringPolicy::new().with_max_duration(Duration::from_millis(50));

        let result = resource
            .call_with_retries(&stub, "publish", &policy, None, || script.run())
            .await;

        assert_eq!(result, Err(hard(320)));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_steps_fail_fast_on_connection_closure() {
        let resource = RetryableResource::new();
        resource.mark_unavailable();
        let stub = recoverable();
        let script = Script::new(vec![hard(320)]);
        let mut stats = RecurringStats::new(&RecurringPolicy::always());

        let result = resource
            .call_with_retries(
                &stub,
                "recover",
                &RecurringPolicy::always(),
                Some(&mut stats),
                || script.run(),
            )
            .await;

        assert_eq!(result, Err(hard(320)));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_steps_retry_channel_closures() {
        let resource = RetryableResource::new();
        let stub = recoverable();
        let script = Script::new(vec![soft(404), soft(406)]);
        let policy = policy(-1, 5);
        let mut stats = RecurringStats::new(&policy);

        let result = resource
            .call_with_retries(&stub, "recover", &policy, Some(&mut stats), || {
                script.run()
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(stats.attempt_count(), 2);
        assert_eq!(stub.recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_interrupts_retry_sleep() {
        let resource = Arc::new(RetryableResource::new());
        let closing = resource.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            closing.close();
        });

        let stub = recoverable();
        let script = Script::new(vec![AmqpError::Timeout; 2]);
        let started = Instant::now();
        let result = resource
            .call_with_retries(&stub, "publish", &policy(5, 1000), None, || script.run())
            .await;

        assert_eq!(result, Err(AmqpError::Timeout));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(resource.is_closed());
        assert!(!resource.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_failure_is_returned_instead_of_waiting() {
        let resource = RetryableResource::new();
        resource.mark_unavailable();
        resource.fail(AmqpError::ConnectionRefused("localhost:5672".into()));
        let stub = recoverable();
        let script = Script::new(vec![hard(320)]);

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            resource.call_with_retries(&stub, "publish", &policy(-1, 1), None, || script.run()),
        )
        .await;

        assert_eq!(
            result,
            Ok(Err(AmqpError::ConnectionRefused("localhost:5672".into())))
        );
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);

        resource.mark_available();
        assert_eq!(resource.recovery_failure(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_recovery_releases_waiters() {
        let resource = Arc::new(RetryableResource::new());
        resource.mark_unavailable();
        let failing = resource.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            failing.fail(AmqpError::Timeout);
        });
        let stub = recoverable();
        let script = Script::new(vec![hard(320)]);

        let result = resource
            .call_with_retries(&stub, "publish", &policy(-1, 1), None, || script.run())
            .await;

        assert_eq!(result, Err(AmqpError::Timeout));
    }

    #[test]
    fn availability_transitions_once() {
        let resource = RetryableResource::new();
        assert!(resource.mark_unavailable());
        assert!(!resource.mark_unavailable());
        assert!(!resource.is_available());
        assert!(resource.mark_available());
        assert!(!resource.mark_available());
        assert!(resource.is_available());
    }
}
