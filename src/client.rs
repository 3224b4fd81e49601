// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Protocol Client Seam
//!
//! The traits in this module describe the plain AMQP client the recovery layer
//! wraps. The lapin driver implements them against a real broker, the
//! recovering handlers implement them again on top of any implementation, so
//! application code depends on [`AmqpConnection`] and [`AmqpChannel`] only.

use crate::{
    config::ConnectionOptions,
    errors::{AmqpError, ShutdownSignal},
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    topology::Binding,
};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone, Default)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Arguments of a `basic.consume`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeArguments {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) no_local: bool,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: FieldTable,
}

impl ConsumeArguments {
    /// Consumes from `queue` with a broker-generated tag and manual acks.
    pub fn new(queue: &str) -> ConsumeArguments {
        ConsumeArguments {
            queue: queue.to_owned(),
            ..ConsumeArguments::default()
        }
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl From<&str> for ConsumeArguments {
    fn from(queue: &str) -> Self {
        ConsumeArguments::new(queue)
    }
}

/// Receives deliveries for one `basic.consume`.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn handle_delivery(&self, consumer_tag: &str, delivery: Delivery);

    async fn handle_cancel(&self, _consumer_tag: &str) {}

    async fn handle_shutdown(&self, _consumer_tag: &str, _signal: &ShutdownSignal) {}
}

pub trait ShutdownListener: Send + Sync {
    fn shutdown_completed(&self, signal: &ShutdownSignal);
}

pub trait ConfirmListener: Send + Sync {
    fn handle_ack(&self, delivery_tag: u64, multiple: bool);

    fn handle_nack(&self, delivery_tag: u64, multiple: bool);
}

pub trait FlowListener: Send + Sync {
    fn handle_flow(&self, active: bool);
}

pub trait ReturnListener: Send + Sync {
    fn handle_return(&self, message: &ReturnedMessage);
}

/// An AMQP channel.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn channel_number(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, definition: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError>;

    /// Binds `binding.destination` (an exchange) to `binding.source`.
    async fn exchange_bind(&self, binding: &Binding) -> Result<(), AmqpError>;

    async fn exchange_unbind(&self, binding: &Binding) -> Result<(), AmqpError>;

    /// Declares a queue and returns the name the broker assigned to it.
    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<String, AmqpError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError>;

    /// Binds `binding.destination` (a queue) to `binding.source`.
    async fn queue_bind(&self, binding: &Binding) -> Result<(), AmqpError>;

    async fn queue_unbind(&self, binding: &Binding) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer and returns its tag.
    async fn basic_consume(
        &self,
        arguments: &ConsumeArguments,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn tx_select(&self) -> Result<(), AmqpError>;

    async fn tx_commit(&self) -> Result<(), AmqpError>;

    async fn tx_rollback(&self) -> Result<(), AmqpError>;

    async fn channel_flow(&self, active: bool) -> Result<(), AmqpError>;

    /// Consumer receiving deliveries that match no registered consumer.
    fn set_default_consumer(&self, consumer: Option<Arc<dyn Consumer>>);

    fn add_confirm_listener(&self, listener: Arc<dyn ConfirmListener>);

    fn remove_confirm_listener(&self, listener: &Arc<dyn ConfirmListener>) -> bool;

    fn clear_confirm_listeners(&self);

    fn add_flow_listener(&self, listener: Arc<dyn FlowListener>);

    fn remove_flow_listener(&self, listener: &Arc<dyn FlowListener>) -> bool;

    fn clear_flow_listeners(&self);

    fn add_return_listener(&self, listener: Arc<dyn ReturnListener>);

    fn remove_return_listener(&self, listener: &Arc<dyn ReturnListener>) -> bool;

    fn clear_return_listeners(&self);

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>);

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Closes the channel, ignoring any failure.
    async fn abort(&self);
}

/// An AMQP connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Opens a channel, with the given number if any.
    async fn create_channel(
        &self,
        channel_number: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>);

    fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;

    async fn abort(&self);
}

/// Opens raw connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectionOptions,
        name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}
