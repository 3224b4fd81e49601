// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! Queue definitions passed to `queue_declare`, plus the shared declaration
//! record the connection keeps for queues that must be declared again after a
//! connection loss. Server-named queues get a new name on every declaration,
//! so the record's name can change during recovery.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::sync::Mutex;

/// Header field for setting message Time-To-Live in queue arguments
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field for setting the maximum number of messages in a queue
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field for setting the maximum size in bytes of a queue
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Header field for configuring a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field for configuring the routing key used for dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: FieldTable,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// A queue named by the broker.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is cancelled.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    pub fn ttl(self, ttl: i32) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongInt(ttl))
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongInt(max))
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, AMQPValue::LongInt(max_bytes))
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.argument(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
        .argument(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQPValue::LongString(LongString::from(routing_key)),
        )
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }

    /// Returns whether the queue is lost with the connection and has to be
    /// declared again after recovery.
    pub(crate) fn needs_recovery(&self) -> bool {
        !self.passive && (!self.durable || self.auto_delete || self.exclusive)
    }
}

/// A declared queue remembered for recovery.
///
/// Shared between the topology registry and the consumers reading from the
/// queue, so a rename during recovery is visible to both.
#[derive(Debug)]
pub(crate) struct QueueDeclaration {
    name: Mutex<String>,
    definition: QueueDefinition,
}

impl QueueDeclaration {
    pub(crate) fn new(name: &str, definition: QueueDefinition) -> QueueDeclaration {
        QueueDeclaration {
            name: Mutex::new(name.to_owned()),
            definition,
        }
    }

    /// The name the broker currently knows the queue by.
    pub(crate) fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn rename(&self, name: &str) {
        *self
            .name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name.to_owned();
    }

    pub(crate) fn definition(&self) -> &QueueDefinition {
        &self.definition
    }
}
