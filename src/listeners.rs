// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovery Listeners
//!
//! Callbacks notified about connection, channel and consumer creation and
//! recovery. Every method has an empty default so implementors only override
//! the events they care about.
//!
//! A listener returning an error is logged and otherwise ignored, unless the
//! configuration marks listener errors as fatal; then the error fails the
//! creation or recovery attempt that triggered it. Errors from failure
//! events are always only logged.

use crate::{
    client::{AmqpChannel, AmqpConnection, Consumer},
    errors::AmqpError,
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::warn;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub trait ConnectionListener: Send + Sync {
    fn on_create(&self, _connection: &dyn AmqpConnection) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_create_failure(&self, _failure: &AmqpError) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery_started(&self, _connection: &dyn AmqpConnection) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called once the connection is re-established, before channels are recovered.
    fn on_recovery(&self, _connection: &dyn AmqpConnection) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called once the connection and all of its channels are recovered.
    fn on_recovery_completed(&self, _connection: &dyn AmqpConnection) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery_failure(
        &self,
        _connection: &dyn AmqpConnection,
        _failure: &AmqpError,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

pub trait ChannelListener: Send + Sync {
    fn on_create(&self, _channel: &dyn AmqpChannel) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_create_failure(&self, _failure: &AmqpError) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery_started(&self, _channel: &dyn AmqpChannel) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery(&self, _channel: &dyn AmqpChannel) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery_completed(&self, _channel: &dyn AmqpChannel) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery_failure(
        &self,
        _channel: &dyn AmqpChannel,
        _failure: &AmqpError,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

pub trait ConsumerListener: Send + Sync {
    fn on_recovery_started(
        &self,
        _consumer: &dyn Consumer,
        _channel: &dyn AmqpChannel,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery(
        &self,
        _consumer: &dyn Consumer,
        _channel: &dyn AmqpChannel,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_recovery_failure(
        &self,
        _consumer: &dyn Consumer,
        _channel: &dyn AmqpChannel,
        _failure: &AmqpError,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Calls `event` on every listener.
///
/// # Errors
///
/// When `fatal` is set the first listener error is returned as
/// [`AmqpError::ListenerError`] and the remaining listeners are skipped.
pub(crate) fn notify<L: ?Sized>(
    listeners: &[Arc<L>],
    event: &'static str,
    fatal: bool,
    mut call: impl FnMut(&L) -> Result<(), ListenerError>,
) -> Result<(), AmqpError> {
    for listener in listeners {
        if let Err(err) = call(listener) {
            warn!(error = err.to_string(), event, "listener failure");
            if fatal {
                return Err(AmqpError::ListenerError(err.to_string()));
            }
        }
    }
    Ok(())
}

/// Calls a failure `event` on every listener.
///
/// Listener errors are only logged: the failure being reported is what the
/// caller returns, whether or not listener errors are fatal.
pub(crate) fn notify_failure<L: ?Sized>(
    listeners: &[Arc<L>],
    event: &'static str,
    mut call: impl FnMut(&L) -> Result<(), ListenerError>,
) {
    for listener in listeners {
        if let Err(err) = call(listener) {
            warn!(error = err.to_string(), event, "listener failure");
        }
    }
}

/// Ordered set of listeners compared by identity.
pub(crate) struct ListenerSet<T: ?Sized> {
    items: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        ListenerSet {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.lock().len())
            .finish()
    }
}

impl<T: ?Sized> ListenerSet<T> {
    pub(crate) fn new() -> Self {
        ListenerSet::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<T>>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a listener unless the same instance is already present.
    pub(crate) fn add(&self, listener: Arc<T>) {
        let mut items = self.lock();
        if !items.iter().any(|item| same_instance(item, &listener)) {
            items.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<T>) -> bool {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|item| !same_instance(item, listener));
        items.len() != before
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.lock().clone()
    }
}

pub(crate) fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}
