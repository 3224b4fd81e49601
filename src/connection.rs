// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering Connection
//!
//! [`ConnectionHandler`] owns the protocol connection, the topology declared
//! through its channels and the channel handlers themselves. When the broker
//! or the network drops the connection, a background task reconnects,
//! replays the recorded topology and recovers every channel, while
//! operations issued in the meantime wait for the outcome.
//!
//! Connections are created through [`Connections`], which shares one
//! [`RecoveryPool`] between all connections it creates.

use crate::{
    channel::{ChannelHandler, RecoveryTrigger},
    client::{AmqpChannel, AmqpConnection, ConnectionFactory, ShutdownListener},
    config::{Config, ConnectionOptions},
    driver::LapinConnectionFactory,
    errors::{AmqpError, ShutdownSignal},
    exchange::ExchangeDefinition,
    executor::RecoveryPool,
    listeners::{self, ConnectionListener, ListenerError},
    policy::RecurringPolicy,
    queue::{QueueDeclaration, QueueDefinition},
    retryable::{Recoverable, RetryableResource},
    stats::RecurringStats,
    topology::{lock_registry, Binding, TopologyRegistry, TopologyReplay},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};
use tracing::{debug, error, info, warn};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates recovering connections sharing one recovery pool.
pub struct Connections {
    factory: Arc<dyn ConnectionFactory>,
    pool: RecoveryPool,
}

impl Default for Connections {
    fn default() -> Self {
        Connections::new()
    }
}

impl Connections {
    /// Connections backed by lapin.
    pub fn new() -> Connections {
        Connections::with_factory(Arc::new(LapinConnectionFactory))
    }

    pub fn with_factory(factory: Arc<dyn ConnectionFactory>) -> Connections {
        Connections {
            factory,
            pool: RecoveryPool::new(),
        }
    }

    pub fn pool(&self) -> &RecoveryPool {
        &self.pool
    }

    /// Opens a connection, retrying under the config's connect policy.
    ///
    /// # Parameters
    /// * `options` - Broker addresses and credentials
    /// * `config` - Retry, recovery and listener settings inherited by the connection's channels
    ///
    /// # Returns
    /// The connection on success, or the last connect failure
    pub async fn create(
        &self,
        options: ConnectionOptions,
        config: Config,
    ) -> Result<Arc<ConnectionHandler>, AmqpError> {
        ConnectionHandler::connect(options, config, self.factory.clone(), self.pool.clone()).await
    }

    /// Stops every recovery in progress. Connections are not closed.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// The retry loop's view of a connection attempt.
struct Handshake;

impl Recoverable for Handshake {
    fn can_recover(&self, _connection_closed: bool) -> bool {
        true
    }

    fn shutdown_observed(&self, _signal: &ShutdownSignal) {}
}

/// Routes closures of a protocol connection back to its handler.
struct DelegateShutdown {
    handler: Weak<ConnectionHandler>,
    generation: u64,
}

impl ShutdownListener for DelegateShutdown {
    fn shutdown_completed(&self, signal: &ShutdownSignal) {
        if let Some(handler) = self.handler.upgrade() {
            if handler.generation.load(Ordering::SeqCst) == self.generation {
                handler.on_shutdown(signal, true);
            }
        }
    }
}

pub struct ConnectionHandler {
    name: String,
    options: ConnectionOptions,
    config: Arc<Config>,
    factory: Arc<dyn ConnectionFactory>,
    pool: RecoveryPool,
    pub(crate) resource: RetryableResource,
    delegate: RwLock<Arc<dyn AmqpConnection>>,
    generation: AtomicU64,
    channels: Mutex<HashMap<u64, Weak<ChannelHandler>>>,
    next_channel_id: AtomicU64,
    topology: Mutex<TopologyRegistry>,
    recovering: AtomicBool,
    recovery_pending: AtomicBool,
    self_ref: Weak<ConnectionHandler>,
}

impl ConnectionHandler {
    async fn connect(
        options: ConnectionOptions,
        config: Config,
        factory: Arc<dyn ConnectionFactory>,
        pool: RecoveryPool,
    ) -> Result<Arc<ConnectionHandler>, AmqpError> {
        pool.bind_current();
        let config = Arc::new(config);
        let name = options.name.clone().unwrap_or_else(|| {
            format!("cxn-{}", CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1)
        });
        let listeners = config.connection_listeners();
        let fatal = config.listener_errors_fatal();

        let policy = config.connect_retry_policy();
        let attempts = RetryableResource::new();
        let connected = attempts
            .call_with_retries(&Handshake, "connect", &policy, None, || {
                factory.connect(&options, &name)
            })
            .await;
        let delegate = match connected {
            Ok(delegate) => delegate,
            Err(err) => {
                error!(error = err.to_string(), connection = name, "failure to connect");
                listeners::notify_failure(&listeners, "connection create failure", |listener| {
                    listener.on_create_failure(&err)
                });
                return Err(err);
            }
        };

        let handler = Arc::new_cyclic(|self_ref| ConnectionHandler {
            name,
            options,
            config,
            factory,
            pool,
            resource: RetryableResource::new(),
            delegate: RwLock::new(delegate.clone()),
            generation: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU64::new(1),
            topology: Mutex::new(TopologyRegistry::default()),
            recovering: AtomicBool::new(false),
            recovery_pending: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        delegate.add_shutdown_listener(Arc::new(DelegateShutdown {
            handler: Arc::downgrade(&handler),
            generation: 0,
        }));
        info!(connection = handler.name, "connection created");

        if let Err(err) = listeners::notify(&listeners, "connection create", fatal, |listener| {
            listener.on_create(handler.as_ref())
        }) {
            handler.abort().await;
            return Err(err);
        }
        Ok(handler)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn pool(&self) -> &RecoveryPool {
        &self.pool
    }

    /// Returns whether the connection can currently be used, i.e. is not being recovered.
    pub fn is_available(&self) -> bool {
        self.resource.is_available()
    }

    pub fn is_closed(&self) -> bool {
        self.resource.is_closed()
    }

    /// The protocol connection currently backing this handler.
    pub(crate) fn delegate(&self) -> Arc<dyn AmqpConnection> {
        self.delegate
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Open channel handlers.
    pub fn channels(&self) -> Vec<Arc<ChannelHandler>> {
        let mut channels = lock(&self.channels);
        channels.retain(|_, channel| channel.strong_count() > 0);
        channels.values().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn forget_channel(&self, id: u64) {
        lock(&self.channels).remove(&id);
    }

    /// Opens a recovering channel configured by the connection's config.
    pub async fn open_channel(
        &self,
        channel_number: Option<u16>,
    ) -> Result<Arc<ChannelHandler>, AmqpError> {
        self.open_channel_with(channel_number, Config::child_of(self.config.clone()))
            .await
    }

    /// Opens a recovering channel with its own config.
    ///
    /// Settings missing from `config` are not looked up on the connection
    /// unless `config` was created with [`Config::child_of`] from
    /// [`ConnectionHandler::config`].
    pub async fn open_channel_with(
        &self,
        channel_number: Option<u16>,
        config: Config,
    ) -> Result<Arc<ChannelHandler>, AmqpError> {
        if self.resource.is_closed() {
            return Err(AmqpError::closed_by_application("connection"));
        }
        let listeners = config.channel_listeners();
        let fatal = config.listener_errors_fatal();

        let policy = self.config.connection_retry_policy();
        let opened = self
            .resource
            .call_with_retries(self, "channel.open", &policy, None, || {
                self.create_delegate_channel(channel_number)
            })
            .await;
        let delegate = match opened {
            Ok(delegate) => delegate,
            Err(err) => {
                error!(error = err.to_string(), connection = self.name, "failure to open channel");
                listeners::notify_failure(&listeners, "channel create failure", |listener| {
                    listener.on_create_failure(&err)
                });
                return Err(err);
            }
        };
        let Some(connection) = self.self_ref.upgrade() else {
            delegate.abort().await;
            return Err(AmqpError::closed_by_application("connection"));
        };

        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let channel = ChannelHandler::new(id, connection, delegate, config);
        lock(&self.channels).insert(id, Arc::downgrade(&channel));
        debug!(
            connection = self.name,
            channel = channel.channel_number(),
            "channel created"
        );

        if let Err(err) = listeners::notify(&listeners, "channel create", fatal, |listener| {
            listener.on_create(channel.as_ref())
        }) {
            channel.abort().await;
            return Err(err);
        }
        Ok(channel)
    }

    /// Opens a protocol channel on the current protocol connection, without retries.
    pub(crate) async fn create_delegate_channel(
        &self,
        channel_number: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.delegate().create_channel(channel_number).await
    }

    pub(crate) fn register_exchange(&self, definition: &ExchangeDefinition) {
        lock_registry(&self.topology).add_exchange(definition.clone());
    }

    pub(crate) fn unregister_exchange(&self, name: &str) {
        lock_registry(&self.topology).remove_exchange(name);
    }

    pub(crate) fn register_exchange_binding(&self, binding: &Binding) {
        lock_registry(&self.topology).add_exchange_binding(binding.clone());
    }

    pub(crate) fn unregister_exchange_binding(&self, binding: &Binding) {
        lock_registry(&self.topology).remove_exchange_binding(binding);
    }

    pub(crate) fn register_queue(&self, name: &str, definition: &QueueDefinition) {
        lock_registry(&self.topology)
            .add_queue(Arc::new(QueueDeclaration::new(name, definition.clone())));
    }

    pub(crate) fn registered_queue(&self, name: &str) -> Option<Arc<QueueDeclaration>> {
        lock_registry(&self.topology).queue(name)
    }

    pub(crate) fn unregister_queue(&self, name: &str) {
        lock_registry(&self.topology).remove_queue(name);
    }

    pub(crate) fn register_queue_binding(&self, binding: &Binding) {
        lock_registry(&self.topology).add_queue_binding(binding.clone());
    }

    pub(crate) fn unregister_queue_binding(&self, binding: &Binding) {
        lock_registry(&self.topology).remove_queue_binding(binding);
    }

    /// Names of the queues recorded for recovery.
    pub fn recorded_queues(&self) -> Vec<String> {
        lock_registry(&self.topology)
            .queues()
            .iter()
            .map(|queue| queue.name())
            .collect()
    }

    /// Names of the exchanges recorded for recovery.
    pub fn recorded_exchanges(&self) -> Vec<String> {
        lock_registry(&self.topology)
            .exchanges()
            .iter()
            .map(|exchange| exchange.name().to_owned())
            .collect()
    }

    pub(crate) fn topology_replay(&self) -> TopologyReplay<'_> {
        TopologyReplay::new(&self.topology, self.delegate())
    }

    /// Reacts to a connection closure seen by an operation.
    pub(crate) fn handle_shutdown(&self, signal: &ShutdownSignal) {
        self.on_shutdown(signal, false);
    }

    fn on_shutdown(&self, signal: &ShutdownSignal, from_delegate: bool) {
        if signal.initiated_by_application || self.resource.is_closed() {
            return;
        }
        let transitioned = self.resource.mark_unavailable();
        if !transitioned && !from_delegate {
            return;
        }
        if transitioned {
            warn!(
                connection = self.name,
                reply_code = signal.reply_code,
                reply_text = signal.reply_text,
                "connection closed unexpectedly"
            );
        }
        let channels = self.channels();
        for channel in &channels {
            channel.connection_lost();
        }

        if !self.can_recover(true) {
            self.resource.interrupt_waiters();
            for channel in &channels {
                channel.resource.interrupt_waiters();
            }
            return;
        }
        self.schedule_recovery();
    }

    fn schedule_recovery(&self) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            self.recovery_pending.store(true, Ordering::SeqCst);
            return;
        }
        let Some(handler) = self.self_ref.upgrade() else {
            self.recovering.store(false, Ordering::SeqCst);
            return;
        };
        if !self
            .pool
            .spawn("connection recovery", handler.run_recovery())
        {
            self.recovering.store(false, Ordering::SeqCst);
            self.resource.interrupt_waiters();
        }
    }

    async fn run_recovery(self: Arc<Self>) {
        let policy = self.config.connection_recovery_policy();
        loop {
            self.recovery_pending.store(false, Ordering::SeqCst);
            if let Err(err) = self.recover_with_retries(&policy).await {
                self.recovery_failed(&err);
            }
            self.recovering.store(false, Ordering::SeqCst);

            if self.resource.is_closed() || !self.recovery_pending.load(Ordering::SeqCst) {
                return;
            }
            if self.recovering.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn recover_with_retries(&self, policy: &RecurringPolicy) -> Result<(), AmqpError> {
        let mut stats = RecurringStats::new(policy);
        loop {
            let err = match self.recover_connection(policy, &mut stats).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if self.resource.is_closed()
                || !err.is_connection_closure()
                || !policy.allows_attempts()
                || stats.is_policy_exceeded()
            {
                return Err(err);
            }
            stats.increment_attempts();
            warn!(
                error = err.to_string(),
                connection = self.name,
                attempt = stats.attempt_count(),
                "connection lost during recovery, retrying"
            );
            if !self.resource.retry_waiter.sleep(stats.wait_time()).await {
                return Err(err);
            }
        }
    }

    fn notify_listeners(
        &self,
        event: &'static str,
        call: impl FnMut(&(dyn ConnectionListener + 'static)) -> Result<(), ListenerError>,
    ) -> Result<(), AmqpError> {
        listeners::notify(
            &self.config.connection_listeners(),
            event,
            self.config.listener_errors_fatal(),
            call,
        )
    }

    async fn recover_connection(
        &self,
        policy: &RecurringPolicy,
        stats: &mut RecurringStats,
    ) -> Result<(), AmqpError> {
        self.resource.mark_unavailable();
        info!(connection = self.name, "recovering connection");
        self.notify_listeners("connection recovery started", |listener| {
            listener.on_recovery_started(self)
        })?;

        let delegate = self
            .resource
            .call_with_retries(&Handshake, "reconnect", policy, Some(stats), || {
                self.factory.connect(&self.options, &self.name)
            })
            .await?;

        // closures of earlier delegates are already handled by this reconnect
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.recovery_pending.store(false, Ordering::SeqCst);
        delegate.add_shutdown_listener(Arc::new(DelegateShutdown {
            handler: self.self_ref.clone(),
            generation,
        }));
        for listener in self.resource.shutdown_listeners.snapshot() {
            delegate.add_shutdown_listener(listener);
        }
        *self
            .delegate
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delegate.clone();
        info!(connection = self.name, "connection re-established");

        if let Err(err) = self.restore().await {
            self.abandon(&delegate).await;
            return Err(err);
        }
        Ok(())
    }

    /// Replays topology and recovers the channels over the current delegate.
    async fn restore(&self) -> Result<(), AmqpError> {
        self.notify_listeners("connection recovery", |listener| listener.on_recovery(self))?;

        let mut replay = self.topology_replay();
        let replayed = replay.install().await;
        replay.finish().await;
        replayed?;

        for channel in self.channels() {
            if !channel.can_recover(true) {
                debug!(
                    connection = self.name,
                    channel = channel.channel_number(),
                    "channel recovery disabled"
                );
                continue;
            }
            channel.recover(RecoveryTrigger::Connection).await?;
        }

        if self.recovery_pending.swap(false, Ordering::SeqCst) {
            return Err(AmqpError::Shutdown(ShutdownSignal::connection(
                320,
                "connection closed during recovery",
            )));
        }
        self.resource.mark_available();
        info!(connection = self.name, "connection recovered");
        self.notify_listeners("connection recovery completed", |listener| {
            listener.on_recovery_completed(self)
        })
    }

    /// Drops a delegate whose recovery pass failed.
    async fn abandon(&self, delegate: &Arc<dyn AmqpConnection>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.resource.mark_unavailable();
        for channel in self.channels() {
            channel.connection_lost();
        }
        delegate.abort().await;
    }

    fn recovery_failed(&self, err: &AmqpError) {
        error!(
            error = err.to_string(),
            connection = self.name,
            "failure to recover connection"
        );
        listeners::notify_failure(
            &self.config.connection_listeners(),
            "connection recovery failure",
            |listener| listener.on_recovery_failure(self, err),
        );
        self.resource.fail(err.clone());
        for channel in self.channels() {
            channel.resource.fail(err.clone());
        }
    }

    fn close_channels(&self) {
        let channels: Vec<_> = lock(&self.channels).drain().map(|(_, channel)| channel).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.connection_closed();
        }
    }
}

impl Recoverable for ConnectionHandler {
    fn can_recover(&self, _connection_closed: bool) -> bool {
        !self.resource.is_closed() && self.config.connection_recovery_policy().allows_attempts()
    }

    fn shutdown_observed(&self, signal: &ShutdownSignal) {
        if signal.hard {
            self.handle_shutdown(signal);
        }
    }
}

#[async_trait]
impl AmqpConnection for ConnectionHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        !self.resource.is_closed() && self.delegate().is_open()
    }

    async fn create_channel(
        &self,
        channel_number: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel: Arc<dyn AmqpChannel> = self.open_channel(channel_number).await?;
        Ok(channel)
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.resource.shutdown_listeners.add(listener.clone());
        self.delegate().add_shutdown_listener(listener);
    }

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool {
        self.delegate().remove_shutdown_listener(listener);
        self.resource.shutdown_listeners.remove(listener)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.resource.close() {
            return Ok(());
        }
        info!(connection = self.name, "closing connection");
        self.close_channels();
        match self.delegate().close().await {
            Err(AmqpError::AlreadyClosed { .. }) => Ok(()),
            result => result,
        }
    }

    async fn abort(&self) {
        if self.resource.close() {
            self.close_channels();
            self.delegate().abort().await;
        }
    }
}
