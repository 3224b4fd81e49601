// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering Channel
//!
//! [`ChannelHandler`] is the channel handed to applications. It forwards
//! every operation to the current protocol channel, retries failed
//! operations and replaces the protocol channel when the broker closes it.
//!
//! A replacement channel gets back everything the application configured on
//! the old one: shutdown, confirm, flow and return listeners, the default
//! consumer, a blocked flow, the last per-consumer prefetch, publisher
//! confirms or transactions, and every consumer. Consumers are recovered
//! under the tag the broker assigned them originally.

use crate::{
    client::{
        AmqpChannel, AmqpConnection, ConfirmListener, ConsumeArguments, Consumer, FlowListener,
        ReturnListener, ShutdownListener,
    },
    circuit::CircuitWait,
    config::Config,
    connection::ConnectionHandler,
    consumer::{ConsumerDeclaration, ConsumerDelegate, DeliveryTags},
    errors::{AmqpError, ShutdownSignal},
    exchange::ExchangeDefinition,
    listeners::{self, ChannelListener, ListenerError, ListenerSet},
    queue::QueueDefinition,
    retryable::{Recoverable, RetryableResource},
    stats::RecurringStats,
    topology::{Binding, TopologyReplay},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};
use tracing::{debug, error, info, warn};

/// What started a channel recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryTrigger {
    /// A failed operation of the application.
    Invocation,
    /// The protocol channel reported an unexpected closure.
    Shutdown,
    /// The connection recovered; topology is already replayed.
    Connection,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes closures of a protocol channel back to its handler.
struct DelegateShutdown {
    handler: Weak<ChannelHandler>,
    generation: u64,
}

impl ShutdownListener for DelegateShutdown {
    fn shutdown_completed(&self, signal: &ShutdownSignal) {
        if let Some(handler) = self.handler.upgrade() {
            handler.delegate_closed(self.generation, signal);
        }
    }
}

pub struct ChannelHandler {
    id: u64,
    channel_number: u16,
    connection: Arc<ConnectionHandler>,
    config: Config,
    pub(crate) resource: RetryableResource,
    delegate: RwLock<Arc<dyn AmqpChannel>>,
    generation: AtomicU64,
    recovery_lock: tokio::sync::Mutex<()>,
    consumers: Mutex<HashMap<String, Arc<ConsumerDeclaration>>>,
    delivery_tags: Arc<DeliveryTags>,
    default_consumer: Mutex<Option<Arc<dyn Consumer>>>,
    confirm_listeners: ListenerSet<dyn ConfirmListener>,
    flow_listeners: ListenerSet<dyn FlowListener>,
    return_listeners: ListenerSet<dyn ReturnListener>,
    prefetch: Mutex<Option<u16>>,
    confirm_select: AtomicBool,
    tx_select: AtomicBool,
    flow_blocked: AtomicBool,
    self_ref: Weak<ChannelHandler>,
}

impl ChannelHandler {
    pub(crate) fn new(
        id: u64,
        connection: Arc<ConnectionHandler>,
        delegate: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Arc<ChannelHandler> {
        let handler = Arc::new_cyclic(|self_ref| ChannelHandler {
            id,
            channel_number: delegate.channel_number(),
            connection,
            config,
            resource: RetryableResource::new(),
            delegate: RwLock::new(delegate.clone()),
            generation: AtomicU64::new(0),
            recovery_lock: tokio::sync::Mutex::new(()),
            consumers: Mutex::new(HashMap::new()),
            delivery_tags: Arc::default(),
            default_consumer: Mutex::new(None),
            confirm_listeners: ListenerSet::new(),
            flow_listeners: ListenerSet::new(),
            return_listeners: ListenerSet::new(),
            prefetch: Mutex::new(None),
            confirm_select: AtomicBool::new(false),
            tx_select: AtomicBool::new(false),
            flow_blocked: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        delegate.add_shutdown_listener(Arc::new(DelegateShutdown {
            handler: Arc::downgrade(&handler),
            generation: 0,
        }));
        handler
    }

    /// Handler id, unique within its connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The protocol channel currently backing this handler.
    pub(crate) fn delegate(&self) -> Arc<dyn AmqpChannel> {
        self.delegate
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionHandler> {
        &self.connection
    }

    /// Returns whether the channel can currently be used, i.e. is not being recovered.
    pub fn is_available(&self) -> bool {
        self.resource.is_available()
    }

    pub fn is_closed(&self) -> bool {
        self.resource.is_closed()
    }

    /// Tags of the consumers that are recovered with this channel.
    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.consumers).keys().cloned().collect()
    }

    /// Marks the channel unavailable because its connection was lost.
    pub(crate) fn connection_lost(&self) {
        self.resource.mark_unavailable();
    }

    /// Closes the handler together with its connection.
    pub(crate) fn connection_closed(&self) {
        if self.resource.close() {
            self.forget_consumers();
        }
    }

    fn delegate_closed(&self, generation: u64, signal: &ShutdownSignal) {
        if generation != self.generation.load(Ordering::SeqCst)
            || signal.initiated_by_application
            || signal.hard
            || self.resource.is_closed()
        {
            return;
        }

        warn!(
            channel = self.channel_number,
            reply_code = signal.reply_code,
            reply_text = signal.reply_text,
            "channel closed unexpectedly"
        );
        if !self.resource.mark_unavailable() || !self.can_recover(false) {
            return;
        }
        let Some(handler) = self.self_ref.upgrade() else {
            return;
        };
        self.connection.pool().spawn("channel recovery", async move {
            if let Err(err) = handler.recover(RecoveryTrigger::Shutdown).await {
                debug!(error = err.to_string(), "channel recovery deferred to connection");
            }
        });
    }

    async fn await_recovery(&self, waiting: CircuitWait) -> bool {
        match self.config.channel_recovery_policy().max_duration() {
            Some(timeout) => matches!(waiting.wait_timeout(timeout).await, Ok(true)),
            None => waiting.wait().await.is_ok(),
        }
    }

    fn notify_channel_listeners(
        &self,
        event: &'static str,
        call: impl FnMut(&(dyn ChannelListener + 'static)) -> Result<(), ListenerError>,
    ) -> Result<(), AmqpError> {
        listeners::notify(
            &self.config.channel_listeners(),
            event,
            self.config.listener_errors_fatal(),
            call,
        )
    }

    /// Replaces the protocol channel and restores its state.
    ///
    /// Only one recovery runs at a time. An invocation finding a recovery in
    /// progress waits for it instead of starting another one.
    ///
    /// # Returns
    /// `Ok(true)` once the channel is usable, `Ok(false)` if recovery failed,
    /// or the connection closure that interrupted the recovery
    pub(crate) async fn recover(&self, trigger: RecoveryTrigger) -> Result<bool, AmqpError> {
        let _pass = match trigger {
            RecoveryTrigger::Invocation => {
                let waiting = self.resource.circuit.register();
                match self.recovery_lock.try_lock() {
                    Ok(guard) => guard,
                    Err(_) => return Ok(self.await_recovery(waiting).await),
                }
            }
            _ => self.recovery_lock.lock().await,
        };
        if self.resource.is_closed() {
            return Ok(false);
        }
        if self.resource.is_available() {
            return Ok(true);
        }

        info!(
            channel = self.channel_number,
            connection = self.connection.name(),
            ?trigger,
            "recovering channel"
        );
        let Err(err) = self.replace_delegate(trigger).await else {
            return Ok(true);
        };
        error!(
            error = err.to_string(),
            channel = self.channel_number,
            "failure to recover channel"
        );
        listeners::notify_failure(
            &self.config.channel_listeners(),
            "channel recovery failure",
            |listener| listener.on_recovery_failure(self, &err),
        );
        // waiters stay parked while the connection recovery retries
        if trigger != RecoveryTrigger::Connection || !err.is_connection_closure() {
            self.resource.circuit.interrupt_waiters();
        }
        if err.is_connection_closure() {
            Err(err)
        } else {
            Ok(false)
        }
    }

    /// One recovery pass: a new protocol channel with the recorded state.
    async fn replace_delegate(&self, trigger: RecoveryTrigger) -> Result<(), AmqpError> {
        self.notify_channel_listeners("channel recovery started", |listener| {
            listener.on_recovery_started(self)
        })?;

        let policy = self.config.channel_recovery_policy();
        let mut stats = RecurringStats::new(&policy);
        let dropped = Mutex::new(HashSet::new());
        let topology_recovered = trigger == RecoveryTrigger::Connection;

        let delegate = self
            .resource
            .call_with_retries(self, "channel recovery", &policy, Some(&mut stats), || {
                self.recover_once(topology_recovered, &dropped)
            })
            .await?;

        *self
            .delegate
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delegate.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.resource.mark_available();
        info!(
            channel = self.channel_number,
            attempts = stats.attempt_count() + 1,
            "channel recovered"
        );
        if let Err(err) = self.notify_channel_listeners("channel recovery completed", |listener| {
            listener.on_recovery_completed(self)
        }) {
            self.resource.mark_unavailable();
            delegate.abort().await;
            return Err(err);
        }
        Ok(())
    }

    async fn recover_once(
        &self,
        topology_recovered: bool,
        dropped: &Mutex<HashSet<String>>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let delegate = self
            .connection
            .create_delegate_channel(Some(self.channel_number))
            .await?;
        if let Err(err) = self.restore(&delegate, topology_recovered, dropped).await {
            delegate.abort().await;
            return Err(err);
        }
        Ok(delegate)
    }

    async fn restore(
        &self,
        delegate: &Arc<dyn AmqpChannel>,
        topology_recovered: bool,
        dropped: &Mutex<HashSet<String>>,
    ) -> Result<(), AmqpError> {
        self.delivery_tags.rebase();

        delegate.add_shutdown_listener(Arc::new(DelegateShutdown {
            handler: self.self_ref.clone(),
            generation: self.generation.load(Ordering::SeqCst) + 1,
        }));
        for listener in self.resource.shutdown_listeners.snapshot() {
            delegate.add_shutdown_listener(listener);
        }
        let default_consumer = lock(&self.default_consumer).clone();
        if default_consumer.is_some() {
            delegate.set_default_consumer(default_consumer);
        }

        if self.flow_blocked.load(Ordering::SeqCst) {
            delegate.channel_flow(false).await?;
        }
        let prefetch = *lock(&self.prefetch);
        if let Some(prefetch) = prefetch {
            delegate.basic_qos(prefetch, false).await?;
        }
        if self.confirm_select.load(Ordering::SeqCst) {
            delegate.confirm_select().await?;
        }
        if self.tx_select.load(Ordering::SeqCst) {
            delegate.tx_select().await?;
        }

        for listener in self.confirm_listeners.snapshot() {
            delegate.add_confirm_listener(listener);
        }
        for listener in self.flow_listeners.snapshot() {
            delegate.add_flow_listener(listener);
        }
        for listener in self.return_listeners.snapshot() {
            delegate.add_return_listener(listener);
        }

        if self.config.is_consumer_recovery_enabled() {
            self.recover_consumers(delegate, topology_recovered, dropped)
                .await?;
        }

        self.notify_channel_listeners("channel recovery", |listener| listener.on_recovery(self))
    }

    async fn recover_consumers(
        &self,
        delegate: &Arc<dyn AmqpChannel>,
        topology_recovered: bool,
        dropped: &Mutex<HashSet<String>>,
    ) -> Result<(), AmqpError> {
        let consumers: Vec<(String, Arc<ConsumerDeclaration>)> = lock(&self.consumers)
            .iter()
            .map(|(tag, declaration)| (tag.clone(), declaration.clone()))
            .collect();
        if consumers.is_empty() {
            return Ok(());
        }

        let mut replay = (!topology_recovered).then(|| self.connection.topology_replay());
        let result = self
            .resubscribe(delegate, &consumers, replay.as_mut(), dropped)
            .await;
        if let Some(replay) = replay {
            replay.finish().await;
        }
        result
    }

    async fn resubscribe(
        &self,
        delegate: &Arc<dyn AmqpChannel>,
        consumers: &[(String, Arc<ConsumerDeclaration>)],
        mut replay: Option<&mut TopologyReplay<'_>>,
        dropped: &Mutex<HashSet<String>>,
    ) -> Result<(), AmqpError> {
        let listeners = self.config.consumer_listeners();
        let fatal = self.config.listener_errors_fatal();

        for (tag, declaration) in consumers {
            if lock(dropped).contains(tag) {
                continue;
            }
            let consumer = declaration.delegate().inner().as_ref();
            listeners::notify(&listeners, "consumer recovery started", fatal, |listener| {
                listener.on_recovery_started(consumer, self)
            })?;

            if let (Some(replay), Some(queue)) = (replay.as_mut(), declaration.queue()) {
                replay.recover_queue(queue).await?;
            }

            let arguments = declaration.arguments();
            debug!(
                consumer_tag = tag,
                queue = arguments.queue(),
                channel = self.channel_number,
                "recovering consumer"
            );
            let subscriber: Arc<dyn Consumer> = declaration.delegate().clone();
            match delegate.basic_consume(&arguments, subscriber).await {
                Ok(_) => {
                    listeners::notify(&listeners, "consumer recovery", fatal, |listener| {
                        listener.on_recovery(consumer, self)
                    })?;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        consumer_tag = tag,
                        queue = arguments.queue(),
                        "failure to recover consumer"
                    );
                    listeners::notify_failure(&listeners, "consumer recovery failure", |listener| {
                        listener.on_recovery_failure(consumer, self, &err)
                    });
                    if err.shutdown_signal().is_some_and(|signal| !signal.hard) {
                        lock(dropped).insert(tag.clone());
                        lock(&self.consumers).remove(tag);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn invoke<T, F, Fut>(&self, operation_name: &'static str, operation: F) -> Result<T, AmqpError>
    where
        F: Fn(Arc<dyn AmqpChannel>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, AmqpError>> + Send,
        T: Send,
    {
        if self.resource.is_closed() {
            return Err(AmqpError::closed_by_application("channel"));
        }
        let policy = self.config.channel_retry_policy();
        self.resource
            .call_with_retries(self, operation_name, &policy, None, || {
                operation(self.delegate())
            })
            .await
    }

    fn forget_consumers(&self) {
        for declaration in lock(&self.consumers).values() {
            declaration.delegate().cancel();
        }
    }
}

#[async_trait]
impl Recoverable for ChannelHandler {
    fn can_recover(&self, connection_closed: bool) -> bool {
        !self.resource.is_closed()
            && self.config.channel_recovery_policy().allows_attempts()
            && (!connection_closed || self.connection.can_recover(true))
    }

    fn shutdown_observed(&self, signal: &ShutdownSignal) {
        if signal.hard {
            self.connection.handle_shutdown(signal);
        } else {
            self.resource.mark_unavailable();
        }
    }

    async fn recover_channel(&self) -> Result<bool, AmqpError> {
        self.recover(RecoveryTrigger::Invocation).await
    }
}

#[async_trait]
impl AmqpChannel for ChannelHandler {
    fn channel_number(&self) -> u16 {
        self.channel_number
    }

    fn is_open(&self) -> bool {
        !self.resource.is_closed() && self.delegate().is_open()
    }

    async fn exchange_declare(&self, definition: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.invoke("exchange.declare", |channel| async move {
            channel.exchange_declare(definition).await
        })
        .await?;
        if definition.needs_recovery() && self.config.is_exchange_recovery_enabled() {
            self.connection.register_exchange(definition);
        }
        Ok(())
    }

    async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.connection.unregister_exchange(exchange);
        self.invoke("exchange.delete", |channel| async move {
            channel.exchange_delete(exchange, if_unused).await
        })
        .await
    }

    async fn exchange_bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.invoke("exchange.bind", |channel| async move {
            channel.exchange_bind(binding).await
        })
        .await?;
        if self.config.is_exchange_recovery_enabled() {
            self.connection.register_exchange_binding(binding);
        }
        Ok(())
    }

    async fn exchange_unbind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.connection.unregister_exchange_binding(binding);
        self.invoke("exchange.unbind", |channel| async move {
            channel.exchange_unbind(binding).await
        })
        .await
    }

    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        let name = self
            .invoke("queue.declare", |channel| async move {
                channel.queue_declare(definition).await
            })
            .await?;
        if definition.needs_recovery() && self.config.is_queue_recovery_enabled() {
            self.connection.register_queue(&name, definition);
        }
        Ok(name)
    }

    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        self.connection.unregister_queue(queue);
        self.invoke("queue.delete", |channel| async move {
            channel.queue_delete(queue, if_unused, if_empty).await
        })
        .await
    }

    async fn queue_bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.invoke("queue.bind", |channel| async move {
            channel.queue_bind(binding).await
        })
        .await?;
        if self.config.is_queue_recovery_enabled() {
            self.connection.register_queue_binding(binding);
        }
        Ok(())
    }

    async fn queue_unbind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.connection.unregister_queue_binding(binding);
        self.invoke("queue.unbind", |channel| async move {
            channel.queue_unbind(binding).await
        })
        .await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.invoke("basic.publish", |channel| {
            let properties = properties.clone();
            async move {
                channel
                    .basic_publish(exchange, routing_key, mandatory, payload, properties)
                    .await
            }
        })
        .await
    }

    async fn basic_consume(
        &self,
        arguments: &ConsumeArguments,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        let delegate = Arc::new(ConsumerDelegate::new(consumer, self.delivery_tags.clone()));
        let consumer_tag = self
            .invoke("basic.consume", |channel| {
                let subscriber: Arc<dyn Consumer> = delegate.clone();
                async move { channel.basic_consume(arguments, subscriber).await }
            })
            .await?;

        if self.config.is_consumer_recovery_enabled() {
            let recorded = arguments.clone().consumer_tag(&consumer_tag);
            let queue = self.connection.registered_queue(arguments.queue());
            lock(&self.consumers).insert(
                consumer_tag.clone(),
                Arc::new(ConsumerDeclaration::new(queue, recorded, delegate)),
            );
        }
        debug!(
            consumer_tag,
            queue = arguments.queue(),
            channel = self.channel_number,
            "consumer created"
        );
        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        if let Some(declaration) = lock(&self.consumers).remove(consumer_tag) {
            declaration.delegate().cancel();
        }
        self.invoke("basic.cancel", |channel| async move {
            channel.basic_cancel(consumer_tag).await
        })
        .await
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        let Some(tag) = self.delivery_tags.to_channel(delivery_tag, multiple) else {
            debug!(delivery_tag, "ignoring ack of a delivery from a previous channel");
            return Ok(());
        };
        self.invoke("basic.ack", |channel| async move {
            channel.basic_ack(tag, multiple).await
        })
        .await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let Some(tag) = self.delivery_tags.to_channel(delivery_tag, multiple) else {
            debug!(delivery_tag, "ignoring nack of a delivery from a previous channel");
            return Ok(());
        };
        self.invoke("basic.nack", |channel| async move {
            channel.basic_nack(tag, multiple, requeue).await
        })
        .await
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let Some(tag) = self.delivery_tags.to_channel(delivery_tag, false) else {
            debug!(delivery_tag, "ignoring reject of a delivery from a previous channel");
            return Ok(());
        };
        self.invoke("basic.reject", |channel| async move {
            channel.basic_reject(tag, requeue).await
        })
        .await
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.invoke("basic.qos", |channel| async move {
            channel.basic_qos(prefetch_count, global).await
        })
        .await?;
        if !global {
            *lock(&self.prefetch) = Some(prefetch_count);
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.invoke("confirm.select", |channel| async move {
            channel.confirm_select().await
        })
        .await?;
        self.confirm_select.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.invoke("tx.select", |channel| async move { channel.tx_select().await })
            .await?;
        self.tx_select.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.invoke("tx.commit", |channel| async move { channel.tx_commit().await })
            .await
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.invoke("tx.rollback", |channel| async move {
            channel.tx_rollback().await
        })
        .await
    }

    async fn channel_flow(&self, active: bool) -> Result<(), AmqpError> {
        self.invoke("channel.flow", |channel| async move {
            channel.channel_flow(active).await
        })
        .await?;
        self.flow_blocked.store(!active, Ordering::SeqCst);
        Ok(())
    }

    fn set_default_consumer(&self, consumer: Option<Arc<dyn Consumer>>) {
        let wrapped = consumer.map(|consumer| {
            Arc::new(ConsumerDelegate::new(consumer, self.delivery_tags.clone())) as Arc<dyn Consumer>
        });
        *lock(&self.default_consumer) = wrapped.clone();
        self.delegate().set_default_consumer(wrapped);
    }

    fn add_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) {
        self.confirm_listeners.add(listener.clone());
        self.delegate().add_confirm_listener(listener);
    }

    fn remove_confirm_listener(&self, listener: &Arc<dyn ConfirmListener>) -> bool {
        self.delegate().remove_confirm_listener(listener);
        self.confirm_listeners.remove(listener)
    }

    fn clear_confirm_listeners(&self) {
        self.confirm_listeners.clear();
        self.delegate().clear_confirm_listeners();
    }

    fn add_flow_listener(&self, listener: Arc<dyn FlowListener>) {
        self.flow_listeners.add(listener.clone());
        self.delegate().add_flow_listener(listener);
    }

    fn remove_flow_listener(&self, listener: &Arc<dyn FlowListener>) -> bool {
        self.delegate().remove_flow_listener(listener);
        self.flow_listeners.remove(listener)
    }

    fn clear_flow_listeners(&self) {
        self.flow_listeners.clear();
        self.delegate().clear_flow_listeners();
    }

    fn add_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        self.return_listeners.add(listener.clone());
        self.delegate().add_return_listener(listener);
    }

    fn remove_return_listener(&self, listener: &Arc<dyn ReturnListener>) -> bool {
        self.delegate().remove_return_listener(listener);
        self.return_listeners.remove(listener)
    }

    fn clear_return_listeners(&self) {
        self.return_listeners.clear();
        self.delegate().clear_return_listeners();
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
        self.connection.forget_channel(self.id);
        self.forget_consumers();
        match self.delegate().close().await {
            Err(AmqpError::AlreadyClosed { .. }) => Ok(()),
            result => result,
        }
    }

    async fn abort(&self) {
        if self.resource.close() {
            self.connection.forget_channel(self.id);
            self.forget_consumers();
            self.delegate().abort().await;
        }
    }
}

/// Opens a recovering connection and a channel on it.
///
/// # Parameters
/// * `options` - Where to connect
/// * `config` - Retry and recovery settings
///
/// # Returns
/// The connection and the channel on success, or an error on failure.
pub async fn new_amqp_channel(
    options: crate::config::ConnectionOptions,
    config: Config,
) -> Result<(Arc<ConnectionHandler>, Arc<ChannelHandler>), AmqpError> {
    let connection = crate::connection::Connections::new()
        .create(options, config)
        .await?;
    let channel = connection.open_channel(None).await?;
    Ok((connection, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionOptions,
        connection::Connections,
        policy::{RecoveryPolicy, RetryPolicy},
        testing::{FakeBroker, RecordingConsumer},
    };
    use std::time::Duration;
    use tokio::time::Instant;

    struct IgnoreConfirms;

    impl ConfirmListener for IgnoreConfirms {
        fn handle_ack(&self, _delivery_tag: u64, _multiple: bool) {}

        fn handle_nack(&self, _delivery_tag: u64, _multiple: bool) {}
    }

    struct RejectsRecovery;

    impl ChannelListener for RejectsRecovery {
        fn on_recovery_started(&self, _channel: &dyn AmqpChannel) -> Result<(), ListenerError> {
            Err("rejected".into())
        }
    }

    fn every(ms: u64) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_interval(Duration::from_millis(ms))
            .unwrap()
    }

    fn recovering() -> Config {
        Config::new()
            .with_retry_policy(every(10))
            .with_recovery_policy(
                RecoveryPolicy::new()
                    .with_interval(Duration::from_millis(10))
                    .unwrap(),
            )
    }

    async fn open(
        broker: &Arc<FakeBroker>,
        config: Config,
    ) -> (Connections, Arc<ConnectionHandler>, Arc<ChannelHandler>) {
        let connections = Connections::with_factory(broker.clone());
        let connection = connections
            .create(ConnectionOptions::new(), config)
            .await
            .unwrap();
        let channel = connection.open_channel(None).await.unwrap();
        (connections, connection, channel)
    }

    fn soft(code: u16) -> AmqpError {
        AmqpError::Shutdown(ShutdownSignal::channel(code, "closed by broker"))
    }

    async fn publish(channel: &ChannelHandler) -> Result<(), AmqpError> {
        channel
            .basic_publish("events", "key", false, b"payload", BasicProperties::default())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn publish_survives_channel_closure_and_timeout() {
        let broker = FakeBroker::new();
        let (_connections, _connection, channel) = open(&broker, recovering()).await;
        broker.fail("basic.publish", soft(311));
        broker.fail("basic.publish", AmqpError::Timeout);
        let started = Instant::now();

        assert_eq!(publish(&channel).await, Ok(()));

        assert_eq!(broker.count("basic.publish:events:key"), 1);
        assert_eq!(broker.count("channel.open:1"), 2);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_millis(25));
        assert!(channel.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_is_recovered_under_its_tag() {
        let broker = FakeBroker::new();
        let (connections, _connection, channel) = open(&broker, recovering()).await;
        let queue = channel
            .queue_declare(&QueueDefinition::new("jobs"))
            .await
            .unwrap();
        let tag = channel
            .basic_consume(
                &ConsumeArguments::new(&queue),
                Arc::new(RecordingConsumer::default()),
            )
            .await
            .unwrap();
        assert_eq!(tag, "amq.ctag-1");

        broker.close_channel(1, ShutdownSignal::channel(406, "PRECONDITION_FAILED"));
        assert!(!channel.is_available());
        connections.pool().drain().await;

        assert!(channel.is_available());
        assert_eq!(broker.count("channel.open:1"), 2);
        assert_eq!(broker.count("queue.declare:jobs"), 2);
        assert_eq!(broker.count("basic.consume:jobs:amq.ctag-1"), 2);
        assert_eq!(channel.consumer_tags(), vec!["amq.ctag-1".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn acks_for_previous_channels_are_dropped() {
        let broker = FakeBroker::new();
        let (connections, _connection, channel) = open(&broker, recovering()).await;
        let consumer = Arc::new(RecordingConsumer::default());
        channel
            .basic_consume(&ConsumeArguments::new("jobs"), consumer.clone())
            .await
            .unwrap();
        assert!(broker.deliver("amq.ctag-1", 1).await);

        broker.close_channel(1, ShutdownSignal::channel(406, "PRECONDITION_FAILED"));
        connections.pool().drain().await;
        assert!(broker.deliver("amq.ctag-1", 1).await);
        assert_eq!(consumer.tags(), vec![1, 2]);

        channel.basic_ack(1, false).await.unwrap();
        assert_eq!(broker.count_prefix("basic.ack"), 0);

        channel.basic_ack(2, false).await.unwrap();
        assert_eq!(broker.count("basic.ack:1:false"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_settings_are_replayed() {
        let broker = FakeBroker::new();
        let (connections, _connection, channel) = open(&broker, recovering()).await;
        channel.basic_qos(10, false).await.unwrap();
        channel.confirm_select().await.unwrap();
        channel.channel_flow(false).await.unwrap();
        channel.add_confirm_listener(Arc::new(IgnoreConfirms));

        broker.close_channel(1, ShutdownSignal::channel(406, "PRECONDITION_FAILED"));
        connections.pool().drain().await;

        assert_eq!(broker.count("basic.qos:10:false"), 2);
        assert_eq!(broker.count("confirm.select"), 2);
        assert_eq!(broker.count("channel.flow:false"), 2);
        assert_eq!(broker.open_channel(1).unwrap().confirm_listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closure_is_returned_when_recovery_is_disabled() {
        let broker = FakeBroker::new();
        let config = Config::new()
            .with_channel_retry_policy(every(10))
            .with_channel_recovery_policy(RecoveryPolicy::never());
        let (_connections, _connection, channel) = open(&broker, config).await;
        broker.fail("basic.publish", soft(404));

        let result = publish(&channel).await;

        assert!(matches!(result, Err(AmqpError::Shutdown(ref signal)) if signal.reply_code == 404));
        assert_eq!(broker.count("channel.open:1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_reply_codes_are_not_retried() {
        let broker = FakeBroker::new();
        let (_connections, _connection, channel) = open(&broker, recovering()).await;
        broker.fail("basic.publish", soft(404));

        let result = publish(&channel).await;

        assert!(matches!(result, Err(AmqpError::Shutdown(ref signal)) if signal.reply_code == 404));
        assert_eq!(broker.count("channel.open:1"), 2);
        assert_eq!(broker.count("basic.publish:events:key"), 0);
        assert!(channel.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_rejects_operations() {
        let broker = FakeBroker::new();
        let (_connections, connection, channel) = open(&broker, recovering()).await;

        channel.close().await.unwrap();

        assert!(channel.is_closed());
        assert!(matches!(
            publish(&channel).await,
            Err(AmqpError::AlreadyClosed { signal: None, .. })
        ));
        assert!(connection.channels().is_empty());
        assert_eq!(broker.count("channel.close:1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_transient_topology_is_recorded() {
        let broker = FakeBroker::new();
        let (_connections, connection, channel) = open(&broker, recovering()).await;
        channel
            .exchange_declare(&ExchangeDefinition::new("events").topic())
            .await
            .unwrap();
        channel
            .exchange_declare(&ExchangeDefinition::new("audit").durable())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("archive").durable())
            .await
            .unwrap();
        assert_eq!(connection.recorded_exchanges(), vec!["events".to_owned()]);
        assert!(connection.recorded_queues().is_empty());

        channel.exchange_delete("events", false).await.unwrap();
        assert!(connection.recorded_exchanges().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_closing_the_channel_on_replay_is_dropped() {
        let broker = FakeBroker::new();
        let (connections, _connection, channel) = open(&broker, recovering()).await;
        channel
            .basic_consume(
                &ConsumeArguments::new("jobs"),
                Arc::new(RecordingConsumer::default()),
            )
            .await
            .unwrap();
        broker.fail("basic.consume", soft(404));

        broker.close_channel(1, ShutdownSignal::channel(406, "PRECONDITION_FAILED"));
        connections.pool().drain().await;

        assert!(channel.is_available());
        assert!(channel.consumer_tags().is_empty());
        assert_eq!(broker.count("channel.open:1"), 3);
        assert_eq!(broker.count("basic.consume:jobs:amq.ctag-1"), 1);
        assert!(!broker.deliver("amq.ctag-1", 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_recovery_follows_a_renamed_queue() {
        let broker = FakeBroker::new();
        let (connections, connection, channel) = open(&broker, recovering()).await;
        let queue = channel
            .queue_declare(&QueueDefinition::server_named())
            .await
            .unwrap();
        assert_eq!(queue, "amq.gen-1");
        channel
            .basic_consume(
                &ConsumeArguments::new(&queue),
                Arc::new(RecordingConsumer::default()),
            )
            .await
            .unwrap();

        broker.close_channel(1, ShutdownSignal::channel(406, "PRECONDITION_FAILED"));
        connections.pool().drain().await;

        assert!(channel.is_available());
        assert_eq!(broker.count("connect"), 1);
        assert_eq!(broker.count("queue.declare:amq.gen-2"), 1);
        assert_eq!(broker.count("basic.consume:amq.gen-2:amq.ctag-1"), 1);
        assert_eq!(connection.recorded_queues(), vec!["amq.gen-2".to_owned()]);
        assert!(broker.deliver("amq.ctag-1", 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_listener_errors_fail_channel_recovery() {
        let broker = FakeBroker::new();
        let rejecting: Arc<dyn ChannelListener> = Arc::new(RejectsRecovery);
        let config = recovering()
            .with_channel_listeners(vec![rejecting])
            .with_listener_errors_fatal(true);
        let (connections, _connection, channel) = open(&broker, config).await;
        broker.fail("basic.publish", soft(311));

        let result = publish(&channel).await;
        connections.pool().drain().await;

        assert_eq!(result, Err(soft(311)));
        assert_eq!(broker.count("channel.open:1"), 1);
        assert!(!channel.is_available());
    }
}
