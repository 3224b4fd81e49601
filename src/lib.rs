// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Recovery
//!
//! Connection and channel handles that keep working across broker failures.
//! Failed calls are retried under a [`RetryPolicy`], lost connections and
//! channels are re-created under a [`RecoveryPolicy`], and transient topology
//! and consumers are replayed onto the new resources.
//!
//! ```no_run
//! use rabbitmq_recovery::{AmqpChannel, Config, ConnectionOptions, new_amqp_channel};
//!
//! # async fn run() -> Result<(), rabbitmq_recovery::AmqpError> {
//! let options = ConnectionOptions::new().with_address("localhost", 5672);
//! let (_connection, channel) = new_amqp_channel(options, Config::recover_always()).await?;
//! channel.basic_publish("", "jobs", false, b"hello", Default::default()).await?;
//! # Ok(())
//! # }
//! ```

mod circuit;
mod consumer;
mod driver;
mod executor;
mod listeners;
mod policy;
mod retryable;
mod stats;
mod waiter;

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod queue;
pub mod topology;

#[cfg(test)]
mod testing;

pub use channel::{new_amqp_channel, ChannelHandler};
pub use circuit::Circuit;
pub use client::{
    AmqpChannel, AmqpConnection, ConfirmListener, ConnectionFactory, ConsumeArguments, Consumer,
    Delivery, FlowListener, ReturnListener, ReturnedMessage, ShutdownListener,
};
pub use config::{Address, Config, ConnectionOptions, PolicySettings, RecoverySettings};
pub use connection::{ConnectionHandler, Connections};
pub use driver::LapinConnectionFactory;
pub use errors::{is_retryable_reply_code, AmqpError, ShutdownSignal};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use executor::RecoveryPool;
pub use listeners::{ChannelListener, ConnectionListener, ConsumerListener, ListenerError};
pub use policy::{PolicyError, RecoveryPolicy, RecurringPolicy, RetryPolicy, INFINITE_ATTEMPTS};
pub use queue::QueueDefinition;
pub use stats::{RecurringStats, RetryStats};
pub use topology::Binding;
pub use waiter::{InterruptibleWaiter, Sleeper, TokioSleeper};
