// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovery Task Pool
//!
//! Connection and channel recoveries run as background tasks owned by a
//! [`RecoveryPool`]. The pool is shared by every connection created through
//! the same [`crate::Connections`] and remembers the tokio runtime it was
//! first used on, so shutdown callbacks invoked from a driver thread outside
//! the runtime can still schedule recoveries.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::{runtime::Handle, task::JoinSet};
use tracing::{debug, error};

#[derive(Default)]
struct PoolInner {
    handle: Mutex<Option<Handle>>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct RecoveryPool {
    inner: Arc<PoolInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecoveryPool {
    pub fn new() -> RecoveryPool {
        RecoveryPool::default()
    }

    /// Binds the pool to the runtime of the calling task, if not bound yet.
    pub(crate) fn bind_current(&self) {
        if let Ok(handle) = Handle::try_current() {
            lock(&self.inner.handle).get_or_insert(handle);
        }
    }

    /// Spawns a recovery task.
    ///
    /// # Returns
    /// `false` when the pool was shut down or no runtime is available
    pub(crate) fn spawn<F>(&self, task: &'static str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(task, "recovery pool is shut down, task discarded");
            return false;
        }

        let handle = lock(&self.inner.handle)
            .clone()
            .or_else(|| Handle::try_current().ok());
        let Some(handle) = handle else {
            error!(task, "no tokio runtime available to run recovery");
            return false;
        };

        let mut tasks = lock(&self.inner.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(future, &handle);
        debug!(task, "recovery task scheduled");
        true
    }

    /// Number of tasks not yet reaped.
    pub fn active(&self) -> usize {
        let mut tasks = lock(&self.inner.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Waits until every scheduled task, including tasks they schedule, finished.
    pub async fn drain(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
            if tasks.is_empty() {
                return;
            }
            while tasks.join_next().await.is_some() {}
        }
    }

    /// Stops accepting tasks and aborts the running ones.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        tasks.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
