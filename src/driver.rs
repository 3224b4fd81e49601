// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Driver
//!
//! Implements the protocol client traits on top of lapin. Closures reported
//! by lapin are turned into [`ShutdownSignal`]s and passed to the registered
//! shutdown listeners, which is how the recovering handlers learn that the
//! broker went away.

use crate::{
    client::{
        AmqpChannel, AmqpConnection, ConfirmListener, ConnectionFactory, ConsumeArguments,
        Consumer, Delivery, FlowListener, ReturnListener, ReturnedMessage, ShutdownListener,
    },
    config::ConnectionOptions,
    errors::{AmqpError, ShutdownSignal},
    exchange::ExchangeDefinition,
    listeners::ListenerSet,
    queue::QueueDefinition,
    topology::Binding,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::BasicReturnMessage,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ChannelFlowOptions,
        ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::LongString,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, error, warn};

/// Connects to the broker with lapin, trying each configured address in turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnectionFactory;

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(
        &self,
        options: &ConnectionOptions,
        name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if options.addresses.is_empty() {
            return Err(AmqpError::InvalidConfig("no broker address".to_owned()));
        }

        let mut last_failure = AmqpError::ConnectionError;
        for address in &options.addresses {
            debug!(address = address.to_string(), connection = name, "creating amqp connection...");
            let properties = ConnectionProperties::default()
                .with_connection_name(LongString::from(name.to_owned()));
            let uri = options.uri_for(address);

            let attempt = Connection::connect_uri(uri, properties);
            let connected = match options.connection_timeout() {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result.map_err(AmqpError::from),
                    Err(_) => Err(AmqpError::Timeout),
                },
                None => attempt.await.map_err(AmqpError::from),
            };

            match connected {
                Ok(connection) => {
                    debug!(address = address.to_string(), connection = name, "amqp connected");
                    return Ok(Arc::new(LapinConnection::new(name, connection)));
                }
                Err(err) if err.is_authentication_failure() => return Err(err),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        address = address.to_string(),
                        "failure to connect"
                    );
                    last_failure = err;
                }
            }
        }
        Err(last_failure)
    }
}

fn shutdown_signal_of(err: &lapin::Error) -> ShutdownSignal {
    match err {
        lapin::Error::ProtocolError(amqp) => ShutdownSignal::from(amqp),
        other => ShutdownSignal::connection(0, &other.to_string()),
    }
}

/// Maps a failed channel operation; transport failures mean the connection is gone.
fn channel_failure(err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::IOError(io) => AmqpError::AlreadyClosed {
            resource: "connection",
            signal: Some(ShutdownSignal::connection(0, &io.to_string())),
        },
        other => AmqpError::from(other),
    }
}

pub(crate) struct LapinConnection {
    name: String,
    connection: Connection,
    shutdown_listeners: Arc<ListenerSet<dyn ShutdownListener>>,
    closing: Arc<AtomicBool>,
}

impl LapinConnection {
    fn new(name: &str, connection: Connection) -> LapinConnection {
        let shutdown_listeners: Arc<ListenerSet<dyn ShutdownListener>> = Arc::default();
        let closing = Arc::new(AtomicBool::new(false));

        let listeners = shutdown_listeners.clone();
        let closed_by_us = closing.clone();
        let connection_name = name.to_owned();
        connection.on_error(move |err| {
            if closed_by_us.load(Ordering::SeqCst) {
                return;
            }
            let signal = shutdown_signal_of(&err);
            error!(error = err.to_string(), connection = connection_name, "connection failure");
            for listener in listeners.snapshot() {
                listener.shutdown_completed(&signal);
            }
        });

        LapinConnection {
            name: name.to_owned(),
            connection,
            shutdown_listeners,
            closing,
        }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(
        &self,
        channel_number: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(channel_number) = channel_number {
            debug!(channel_number, "lapin assigns channel numbers itself");
        }
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(channel_failure)?;
        debug!(connection = self.name, channel = channel.id(), "channel created");
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shutdown_listeners.add(listener);
    }

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool {
        self.shutdown_listeners.remove(listener)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);
        let closed = self.connection.close(200, "OK").await.map_err(AmqpError::from);
        let signal = ShutdownSignal::application(true);
        for listener in self.shutdown_listeners.snapshot() {
            listener.shutdown_completed(&signal);
        }
        closed
    }

    async fn abort(&self) {
        if let Err(err) = self.close().await {
            debug!(error = err.to_string(), connection = self.name, "ignoring close failure");
        }
    }
}

/// Listeners shared between a channel and the tasks it spawns.
#[derive(Default)]
struct ChannelListeners {
    shutdown: ListenerSet<dyn ShutdownListener>,
    confirm: ListenerSet<dyn ConfirmListener>,
    flow: ListenerSet<dyn FlowListener>,
    returns: ListenerSet<dyn ReturnListener>,
    closed: AtomicBool,
}

impl ChannelListeners {
    /// Reports the first closure of the channel.
    fn report_closure(&self, signal: &ShutdownSignal) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for listener in self.shutdown.snapshot() {
            listener.shutdown_completed(signal);
        }
    }

    fn returned(&self, message: Box<BasicReturnMessage>) {
        let message = ReturnedMessage {
            reply_code: message.reply_code,
            reply_text: message.reply_text.to_string(),
            exchange: message.delivery.exchange.to_string(),
            routing_key: message.delivery.routing_key.to_string(),
            properties: message.delivery.properties.clone(),
            data: message.delivery.data.clone(),
        };
        for listener in self.returns.snapshot() {
            listener.handle_return(&message);
        }
    }
}

pub(crate) struct LapinChannel {
    channel: Channel,
    listeners: Arc<ChannelListeners>,
    confirms: AtomicBool,
    publish_seq: AtomicU64,
}

impl LapinChannel {
    fn new(channel: Channel) -> LapinChannel {
        LapinChannel {
            channel,
            listeners: Arc::default(),
            confirms: AtomicBool::new(false),
            publish_seq: AtomicU64::new(0),
        }
    }

    /// Maps a failure and reports channel closures to the shutdown listeners.
    fn failed(&self, err: lapin::Error) -> AmqpError {
        let err = channel_failure(err);
        if let Some(signal) = err.shutdown_signal().filter(|signal| !signal.hard) {
            self.listeners.report_closure(signal);
        }
        err
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn channel_number(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, definition: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &definition.name,
                (&definition.kind).into(),
                ExchangeDeclareOptions {
                    passive: definition.passive,
                    durable: definition.durable,
                    auto_delete: definition.auto_delete,
                    internal: definition.internal,
                    nowait: definition.no_wait,
                },
                definition.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(
                exchange,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn exchange_bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions::default(),
                binding.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn exchange_unbind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.channel
            .exchange_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeUnbindOptions::default(),
                binding.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                &definition.name,
                QueueDeclareOptions {
                    passive: definition.passive,
                    durable: definition.durable,
                    exclusive: definition.exclusive,
                    auto_delete: definition.auto_delete,
                    nowait: definition.no_wait,
                },
                definition.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn queue_bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                QueueBindOptions::default(),
                binding.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn queue_unbind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                binding.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| self.failed(err))?;

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(());
        }
        let delivery_tag = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(returned)) => {
                    if let Some(message) = returned {
                        listeners.returned(message);
                    }
                    for listener in listeners.confirm.snapshot() {
                        listener.handle_ack(delivery_tag, false);
                    }
                }
                Ok(Confirmation::Nack(returned)) => {
                    if let Some(message) = returned {
                        listeners.returned(message);
                    }
                    for listener in listeners.confirm.snapshot() {
                        listener.handle_nack(delivery_tag, false);
                    }
                }
                Ok(Confirmation::NotRequested) => {}
                Err(err) => {
                    debug!(error = err.to_string(), delivery_tag, "publisher confirm lost");
                }
            }
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        arguments: &ConsumeArguments,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        let mut stream = self
            .channel
            .basic_consume(
                &arguments.queue,
                &arguments.consumer_tag,
                BasicConsumeOptions {
                    no_local: arguments.no_local,
                    no_ack: arguments.no_ack,
                    exclusive: arguments.exclusive,
                    nowait: false,
                },
                arguments.arguments.clone(),
            )
            .await
            .map_err(|err| self.failed(err))?;

        let consumer_tag = stream.tag().as_str().to_owned();
        let tag = consumer_tag.clone();
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            properties: delivery.properties,
                            data: delivery.data,
                        };
                        consumer.handle_delivery(&tag, delivery).await;
                    }
                    Err(err) => {
                        let signal = shutdown_signal_of(&err);
                        if !signal.hard {
                            listeners.report_closure(&signal);
                        }
                        consumer.handle_shutdown(&tag, &signal).await;
                        return;
                    }
                }
            }
            consumer.handle_cancel(&tag).await;
        });
        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| self.failed(err))
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| self.failed(err))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| self.failed(err))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| self.failed(err))
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| self.failed(err))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| self.failed(err))?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.channel.tx_select().await.map_err(|err| self.failed(err))
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.channel.tx_commit().await.map_err(|err| self.failed(err))
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_rollback()
            .await
            .map_err(|err| self.failed(err))
    }

    async fn channel_flow(&self, active: bool) -> Result<(), AmqpError> {
        self.channel
            .channel_flow(ChannelFlowOptions { active })
            .await
            .map_err(|err| self.failed(err))?;
        for listener in self.listeners.flow.snapshot() {
            listener.handle_flow(active);
        }
        Ok(())
    }

    /// Lapin routes every delivery through the stream of its consumer.
    fn set_default_consumer(&self, consumer: Option<Arc<dyn Consumer>>) {
        if consumer.is_some() {
            debug!(channel = self.channel.id(), "default consumers are not supported by lapin");
        }
    }

    fn add_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) {
        self.listeners.confirm.add(listener);
    }

    fn remove_confirm_listener(&self, listener: &Arc<dyn ConfirmListener>) -> bool {
        self.listeners.confirm.remove(listener)
    }

    fn clear_confirm_listeners(&self) {
        self.listeners.confirm.clear();
    }

    fn add_flow_listener(&self, listener: Arc<dyn FlowListener>) {
        self.listeners.flow.add(listener);
    }

    fn remove_flow_listener(&self, listener: &Arc<dyn FlowListener>) -> bool {
        self.listeners.flow.remove(listener)
    }

    fn clear_flow_listeners(&self) {
        self.listeners.flow.clear();
    }

    fn add_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        self.listeners.returns.add(listener);
    }

    fn remove_return_listener(&self, listener: &Arc<dyn ReturnListener>) -> bool {
        self.listeners.returns.remove(listener)
    }

    fn clear_return_listeners(&self) {
        self.listeners.returns.clear();
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.shutdown.add(listener);
    }

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool {
        self.listeners.shutdown.remove(listener)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let closed = self
            .channel
            .close(200, "OK")
            .await
            .map_err(channel_failure);
        self.listeners.report_closure(&ShutdownSignal::application(false));
        closed
    }

    async fn abort(&self) {
        if let Err(err) = self.close().await {
            debug!(error = err.to_string(), channel = self.channel.id(), "ignoring close failure");
        }
    }
}
