// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Availability Circuit
//!
//! A gate that is closed while a resource is available and open while it is
//! being recovered. Tasks that need the resource wait on the circuit until it
//! closes again, a timeout elapses or the waiters are interrupted.

use crate::errors::AmqpError;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct CircuitState {
    open_count: usize,
    interrupts: u64,
}

#[derive(Debug)]
pub struct Circuit {
    state: watch::Sender<CircuitState>,
}

impl Default for Circuit {
    fn default() -> Self {
        Circuit::new()
    }
}

impl Circuit {
    /// Creates a closed circuit.
    pub fn new() -> Circuit {
        let (state, _) = watch::channel(CircuitState::default());
        Circuit { state }
    }

    /// Opens the circuit. Every call must be paired with a [`Circuit::close`].
    pub fn open(&self) {
        self.state.send_modify(|state| state.open_count += 1);
    }

    /// Closes one level of the circuit, waking waiters once it is fully closed.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if state.open_count == 0 {
                return false;
            }
            state.open_count -= 1;
            state.open_count == 0
        });
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().open_count == 0
    }

    /// Registers a wait that observes every interrupt issued from now on.
    pub(crate) fn register(&self) -> CircuitWait {
        let receiver = self.state.subscribe();
        let generation = receiver.borrow().interrupts;
        CircuitWait {
            receiver,
            generation,
        }
    }

    /// Waits until the circuit is closed.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::Interrupted`] when [`Circuit::interrupt_waiters`] is called
    /// while waiting.
    pub async fn wait(&self) -> Result<(), AmqpError> {
        self.register().wait().await
    }

    /// Waits until the circuit is closed or the timeout elapses.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the circuit closed, `Ok(false)` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool, AmqpError> {
        self.register().wait_timeout(timeout).await
    }

    /// Wakes every current waiter with an interruption.
    pub fn interrupt_waiters(&self) {
        self.state.send_modify(|state| state.interrupts += 1);
    }
}

/// A wait on a [`Circuit`] registered ahead of time.
///
/// Interrupts issued between [`Circuit::register`] and the wait itself are
/// not lost.
pub(crate) struct CircuitWait {
    receiver: watch::Receiver<CircuitState>,
    generation: u64,
}

impl CircuitWait {
    pub(crate) async fn wait(mut self) -> Result<(), AmqpError> {
        loop {
            let state = *self.receiver.borrow_and_update();
            if state.open_count == 0 {
                return Ok(());
            }
            if state.interrupts != self.generation {
                return Err(AmqpError::Interrupted);
            }
            if self.receiver.changed().await.is_err() {
                return Err(AmqpError::Interrupted);
            }
        }
    }

    pub(crate) async fn wait_timeout(self, timeout: Duration) -> Result<bool, AmqpError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn closed_circuit_does_not_block() {
        let circuit = Circuit::new();
        assert!(circuit.is_closed());
        circuit.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_resume_when_closed() {
        let circuit = Arc::new(Circuit::new());
        circuit.open();
        assert!(!circuit.is_closed());

        let waiter = {
            let circuit = circuit.clone();
            tokio::spawn(async move { circuit.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        circuit.close();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn open_and_close_are_paired() {
        let circuit = Circuit::new();
        circuit.open();
        circuit.open();
        circuit.close();
        assert!(!circuit.is_closed());
        circuit.close();
        assert!(circuit.is_closed());
        circuit.close();
        assert!(circuit.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let circuit = Circuit::new();
        circuit.open();
        assert_eq!(circuit.wait_timeout(Duration::from_millis(50)).await, Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_wakes_waiters() {
        let circuit = Arc::new(Circuit::new());
        circuit.open();

        let waiter = {
            let circuit = circuit.clone();
            tokio::spawn(async move { circuit.wait_timeout(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        circuit.interrupt_waiters();

        assert_eq!(waiter.await.unwrap(), Err(AmqpError::Interrupted));
        assert!(!circuit.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn registered_wait_sees_earlier_interrupt() {
        let circuit = Circuit::new();
        circuit.open();
        let waiting = circuit.register();

        circuit.interrupt_waiters();

        assert_eq!(
            waiting.wait_timeout(Duration::from_secs(60)).await,
            Err(AmqpError::Interrupted)
        );
    }
}
