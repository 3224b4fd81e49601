// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the handler tests.
//!
//! Operations succeed and are appended to a log unless a failure was
//! scripted for them. A scripted channel closure closes the fake channel and a
//! scripted connection closure closes the fake connection, both notifying
//! their shutdown listeners the way the lapin driver does.

use crate::{
    client::{
        AmqpChannel, AmqpConnection, ConfirmListener, ConnectionFactory, ConsumeArguments,
        Consumer, Delivery, FlowListener, ReturnListener, ShutdownListener,
    },
    config::ConnectionOptions,
    errors::{AmqpError, ShutdownSignal},
    exchange::ExchangeDefinition,
    listeners::ListenerSet,
    queue::QueueDefinition,
    topology::Binding,
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

/// Consumer remembering the delivery tags it was handed.
#[derive(Default)]
pub(crate) struct RecordingConsumer {
    tags: Mutex<Vec<u64>>,
}

impl RecordingConsumer {
    pub(crate) fn tags(&self) -> Vec<u64> {
        self.tags.lock().unwrap().clone()
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    async fn handle_delivery(&self, _consumer_tag: &str, delivery: Delivery) {
        self.tags.lock().unwrap().push(delivery.delivery_tag);
    }
}

#[derive(Default)]
struct BrokerState {
    log: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, VecDeque<AmqpError>>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    generated_queues: AtomicU64,
    generated_tags: AtomicU64,
}

impl BrokerState {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn take_failure(&self, operation: &str) -> Option<AmqpError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    /// Makes the next `operation` fail with `err`. Failures queue up per operation.
    pub(crate) fn fail(&self, operation: &'static str, err: AmqpError) {
        self.state
            .failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.log().iter().filter(|logged| logged.as_str() == entry).count()
    }

    pub(crate) fn count_prefix(&self, prefix: &str) -> usize {
        self.log()
            .iter()
            .filter(|logged| logged.starts_with(prefix))
            .count()
    }

    pub(crate) fn connection(&self) -> Arc<FakeConnection> {
        self.state
            .connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened")
    }

    /// Closes the latest connection as if the broker dropped it.
    pub(crate) fn kill_connection(&self, signal: ShutdownSignal) {
        self.connection().kill(&signal);
    }

    /// Closes the latest open channel with the given number as if the broker closed it.
    pub(crate) fn close_channel(&self, channel_number: u16, signal: ShutdownSignal) {
        if let Some(channel) = self.open_channel(channel_number) {
            channel.shut(&signal);
        }
    }

    pub(crate) fn open_channel(&self, channel_number: u16) -> Option<Arc<FakeChannel>> {
        self.connection().open_channel(channel_number)
    }

    /// Delivers a message to the consumer with `consumer_tag` on the latest connection.
    pub(crate) async fn deliver(&self, consumer_tag: &str, delivery_tag: u64) -> bool {
        let consumer = self.connection().consumer(consumer_tag);
        match consumer {
            Some(consumer) => {
                let delivery = Delivery {
                    delivery_tag,
                    ..Delivery::default()
                };
                consumer.handle_delivery(consumer_tag, delivery).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ConnectionFactory for FakeBroker {
    async fn connect(
        &self,
        _options: &ConnectionOptions,
        name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if let Some(err) = self.state.take_failure("connect") {
            return Err(err);
        }
        let connection = Arc::new_cyclic(|self_ref| FakeConnection {
            name: name.to_owned(),
            state: self.state.clone(),
            open: AtomicBool::new(true),
            shutdown: ListenerSet::new(),
            channels: Mutex::new(Vec::new()),
            next_channel: AtomicU16::new(1),
            self_ref: self_ref.clone(),
        });
        self.state.connections.lock().unwrap().push(connection.clone());
        self.state.record("connect".to_owned());
        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    name: String,
    state: Arc<BrokerState>,
    open: AtomicBool,
    shutdown: ListenerSet<dyn ShutdownListener>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    next_channel: AtomicU16,
    self_ref: Weak<FakeConnection>,
}

impl FakeConnection {
    fn kill(&self, signal: &ShutdownSignal) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for channel in self.channels.lock().unwrap().iter() {
            channel.open.store(false, Ordering::SeqCst);
        }
        for listener in self.shutdown.snapshot() {
            listener.shutdown_completed(signal);
        }
    }

    fn open_channel(&self, channel_number: u16) -> Option<Arc<FakeChannel>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|channel| channel.number == channel_number && channel.is_open())
            .cloned()
    }

    fn consumer(&self, consumer_tag: &str) -> Option<Arc<dyn Consumer>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|channel| channel.is_open())
            .find_map(|channel| channel.consumers.lock().unwrap().get(consumer_tag).cloned())
    }

    fn gone() -> AmqpError {
        AmqpError::AlreadyClosed {
            resource: "connection",
            signal: Some(ShutdownSignal::connection(0, "connection is not connected")),
        }
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(
        &self,
        channel_number: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_open() {
            return Err(FakeConnection::gone());
        }
        if let Some(err) = self.state.take_failure("channel.open") {
            if let Some(signal) = err.shutdown_signal().filter(|signal| signal.hard) {
                self.kill(signal);
            }
            return Err(err);
        }
        let number = channel_number
            .unwrap_or_else(|| self.next_channel.fetch_add(1, Ordering::SeqCst));
        let channel = Arc::new(FakeChannel {
            number,
            state: self.state.clone(),
            connection: self.self_ref.clone(),
            open: AtomicBool::new(true),
            shutdown: ListenerSet::new(),
            confirm: ListenerSet::new(),
            flow: ListenerSet::new(),
            returns: ListenerSet::new(),
            consumers: Mutex::new(HashMap::new()),
        });
        self.channels.lock().unwrap().push(channel.clone());
        self.state.record(format!("channel.open:{number}"));
        Ok(channel)
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shutdown.add(listener);
    }

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool {
        self.shutdown.remove(listener)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(FakeConnection::gone());
        }
        self.state.record("connection.close".to_owned());
        let signal = ShutdownSignal::application(true);
        for listener in self.shutdown.snapshot() {
            listener.shutdown_completed(&signal);
        }
        Ok(())
    }

    async fn abort(&self) {
        let _ = self.close().await;
    }
}

pub(crate) struct FakeChannel {
    number: u16,
    state: Arc<BrokerState>,
    connection: Weak<FakeConnection>,
    open: AtomicBool,
    shutdown: ListenerSet<dyn ShutdownListener>,
    confirm: ListenerSet<dyn ConfirmListener>,
    flow: ListenerSet<dyn FlowListener>,
    returns: ListenerSet<dyn ReturnListener>,
    consumers: Mutex<HashMap<String, Arc<dyn Consumer>>>,
}

impl FakeChannel {
    fn connection_open(&self) -> bool {
        self.connection
            .upgrade()
            .is_some_and(|connection| connection.is_open())
    }

    fn shut(&self, signal: &ShutdownSignal) {
        if self.open.swap(false, Ordering::SeqCst) {
            for listener in self.shutdown.snapshot() {
                listener.shutdown_completed(signal);
            }
        }
    }

    /// Runs one operation: fails if closed or scripted to fail, otherwise logs `entry`.
    fn step(&self, operation: &'static str, entry: String) -> Result<(), AmqpError> {
        if !self.connection_open() {
            return Err(FakeConnection::gone());
        }
        if !self.is_open() {
            return Err(AmqpError::AlreadyClosed {
                resource: "channel",
                signal: Some(ShutdownSignal::channel(0, "channel is not connected")),
            });
        }
        if let Some(err) = self.state.take_failure(operation) {
            match err.shutdown_signal() {
                Some(signal) if signal.hard => {
                    if let Some(connection) = self.connection.upgrade() {
                        connection.kill(signal);
                    }
                }
                Some(signal) => self.shut(signal),
                None => {}
            }
            return Err(err);
        }
        self.state.record(entry);
        Ok(())
    }

    pub(crate) fn confirm_listener_count(&self) -> usize {
        self.confirm.snapshot().len()
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn channel_number(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, definition: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.step("exchange.declare", format!("exchange.declare:{}", definition.name))
    }

    async fn exchange_delete(&self, exchange: &str, _if_unused: bool) -> Result<(), AmqpError> {
        self.step("exchange.delete", format!("exchange.delete:{exchange}"))
    }

    async fn exchange_bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.step(
            "exchange.bind",
            format!("exchange.bind:{}->{}", binding.source, binding.destination),
        )
    }

    async fn exchange_unbind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.step(
            "exchange.unbind",
            format!("exchange.unbind:{}->{}", binding.source, binding.destination),
        )
    }

    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        let name = if definition.name.is_empty() {
            let generated = self.state.generated_queues.fetch_add(1, Ordering::SeqCst) + 1;
            format!("amq.gen-{generated}")
        } else {
            definition.name.clone()
        };
        self.step("queue.declare", format!("queue.declare:{name}"))?;
        Ok(name)
    }

    async fn queue_delete(
        &self,
        queue: &str,
        _if_unused: bool,
        _if_empty: bool,
    ) -> Result<u32, AmqpError> {
        self.step("queue.delete", format!("queue.delete:{queue}"))?;
        Ok(0)
    }

    async fn queue_bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.step(
            "queue.bind",
            format!("queue.bind:{}->{}", binding.source, binding.destination),
        )
    }

    async fn queue_unbind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.step(
            "queue.unbind",
            format!("queue.unbind:{}->{}", binding.source, binding.destination),
        )
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _mandatory: bool,
        _payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.step("basic.publish", format!("basic.publish:{exchange}:{routing_key}"))
    }

    async fn basic_consume(
        &self,
        arguments: &ConsumeArguments,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        let tag = if arguments.consumer_tag.is_empty() {
            let generated = self.state.generated_tags.fetch_add(1, Ordering::SeqCst) + 1;
            format!("amq.ctag-{generated}")
        } else {
            arguments.consumer_tag.clone()
        };
        self.step(
            "basic.consume",
            format!("basic.consume:{}:{tag}", arguments.queue),
        )?;
        self.consumers.lock().unwrap().insert(tag.clone(), consumer);
        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.step("basic.cancel", format!("basic.cancel:{consumer_tag}"))?;
        self.consumers.lock().unwrap().remove(consumer_tag);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.step("basic.ack", format!("basic.ack:{delivery_tag}:{multiple}"))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.step(
            "basic.nack",
            format!("basic.nack:{delivery_tag}:{multiple}:{requeue}"),
        )
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.step("basic.reject", format!("basic.reject:{delivery_tag}:{requeue}"))
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.step("basic.qos", format!("basic.qos:{prefetch_count}:{global}"))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.step("confirm.select", "confirm.select".to_owned())
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.step("tx.select", "tx.select".to_owned())
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.step("tx.commit", "tx.commit".to_owned())
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.step("tx.rollback", "tx.rollback".to_owned())
    }

    async fn channel_flow(&self, active: bool) -> Result<(), AmqpError> {
        self.step("channel.flow", format!("channel.flow:{active}"))
    }

    fn set_default_consumer(&self, _consumer: Option<Arc<dyn Consumer>>) {}

    fn add_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) {
        self.confirm.add(listener);
    }

    fn remove_confirm_listener(&self, listener: &Arc<dyn ConfirmListener>) -> bool {
        self.confirm.remove(listener)
    }

    fn clear_confirm_listeners(&self) {
        self.confirm.clear();
    }

    fn add_flow_listener(&self, listener: Arc<dyn FlowListener>) {
        self.flow.add(listener);
    }

    fn remove_flow_listener(&self, listener: &Arc<dyn FlowListener>) -> bool {
        self.flow.remove(listener)
    }

    fn clear_flow_listeners(&self) {
        self.flow.clear();
    }

    fn add_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        self.returns.add(listener);
    }

    fn remove_return_listener(&self, listener: &Arc<dyn ReturnListener>) -> bool {
        self.returns.remove(listener)
    }

    fn clear_return_listeners(&self) {
        self.returns.clear();
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shutdown.add(listener);
    }

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool {
        self.shutdown.remove(listener)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::AlreadyClosed {
                resource: "channel",
                signal: Some(ShutdownSignal::application(false)),
            });
        }
        self.state.record(format!("channel.close:{}", self.number));
        self.shut(&ShutdownSignal::application(false));
        Ok(())
    }

    async fn abort(&self) {
        let _ = self.close().await;
    }
}
