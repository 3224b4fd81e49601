// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Interruptible Waits
//!
//! Sleeps between retry attempts that can be cut short when the owning
//! resource is closed. Sleeping goes through the [`Sleeper`] abstraction so
//! tests can observe the requested waits.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub struct InterruptibleWaiter {
    sleeper: Arc<dyn Sleeper>,
    interrupt: Notify,
}

impl fmt::Debug for InterruptibleWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptibleWaiter")
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl Default for InterruptibleWaiter {
    fn default() -> Self {
        InterruptibleWaiter::new(Arc::new(TokioSleeper))
    }
}

impl InterruptibleWaiter {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> InterruptibleWaiter {
        InterruptibleWaiter {
            sleeper,
            interrupt: Notify::new(),
        }
    }

    /// Sleeps for `duration` unless interrupted first.
    ///
    /// # Returns
    ///
    /// `true` when the full duration elapsed, `false` when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let interrupted = self.interrupt.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();

        tokio::select! {
            _ = self.sleeper.sleep(duration) => true,
            _ = interrupted => false,
        }
    }

    /// Interrupts every task currently sleeping on this waiter.
    pub fn interrupt_waiters(&self) {
        self.interrupt.notify_waiters();
    }
}
