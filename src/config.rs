// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Options and Recovery Configuration
//!
//! [`ConnectionOptions`] says where and how to connect. [`Config`] says how
//! failures are handled: retry and recovery policies, recovery switches and
//! listeners. A channel's `Config` falls back to its connection's, so a
//! setting only needs to be given once.
//!
//! Both can be loaded from JSON, recovery settings through [`RecoverySettings`]:
//!
//! ```
//! use rabbitmq_recovery::config::RecoverySettings;
//!
//! let settings = RecoverySettings::from_json(
//!     r#"{ "recovery": { "interval_ms": 100, "max_interval_ms": 5000 } }"#,
//! ).unwrap();
//! let config = settings.into_config().unwrap();
//! assert!(config.channel_recovery_policy().allows_attempts());
//! ```

use crate::{
    errors::AmqpError,
    listeners::{ChannelListener, ConnectionListener, ConsumerListener},
    policy::{PolicyError, RecoveryPolicy, RecurringPolicy, RetryPolicy, INFINITE_ATTEMPTS},
};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

const DEFAULT_PORT: u16 = 5672;

/// A broker host and port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Address {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Address {
    pub fn new(host: &str, port: u16) -> Address {
        Address {
            host: host.to_owned(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AmqpError;

    /// Parses `host` or `host:port`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => port
                .parse()
                .map(|port| Address::new(host, port))
                .map_err(|_| AmqpError::InvalidConfig(format!("invalid port in `{value}`"))),
            None if !value.is_empty() => Ok(Address::new(value, DEFAULT_PORT)),
            _ => Err(AmqpError::InvalidConfig(format!("invalid address `{value}`"))),
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub addresses: Vec<Address>,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: Option<u16>,
    pub connection_timeout_ms: Option<u64>,
    /// Connection name reported to the broker, `cxn-N` when absent
    pub name: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            addresses: vec![Address::new("localhost", DEFAULT_PORT)],
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            heartbeat_secs: None,
            connection_timeout_ms: None,
            name: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> ConnectionOptions {
        ConnectionOptions::default()
    }

    pub fn with_address(mut self, host: &str, port: u16) -> Self {
        self.addresses = vec![Address::new(host, port)];
        self
    }

    /// Sets the addresses from a comma separated `host[:port]` list, tried in order.
    pub fn with_addresses(mut self, addresses: &str) -> Result<Self, AmqpError> {
        self.addresses = addresses
            .split(',')
            .map(Address::from_str)
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat_secs = Some(u16::try_from(heartbeat.as_secs()).unwrap_or(u16::MAX));
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }

    /// Builds the AMQP URI for one of the addresses.
    ///
    /// The URI is assembled from its parts, so credentials and vhost are
    /// passed to the broker verbatim.
    pub fn uri_for(&self, address: &Address) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: address.host.clone(),
                port: address.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: self.heartbeat_secs,
                ..AMQPQueryString::default()
            },
            ..AMQPUri::default()
        }
    }
}

/// Retry, recovery and listener settings with fallback to a parent.
#[derive(Clone, Default)]
pub struct Config {
    parent: Option<Arc<Config>>,
    retry_policy: Option<RetryPolicy>,
    recovery_policy: Option<RecoveryPolicy>,
    connect_retry_policy: Option<RetryPolicy>,
    connection_retry_policy: Option<RetryPolicy>,
    connection_recovery_policy: Option<RecoveryPolicy>,
    channel_retry_policy: Option<RetryPolicy>,
    channel_recovery_policy: Option<RecoveryPolicy>,
    exchange_recovery: Option<bool>,
    queue_recovery: Option<bool>,
    consumer_recovery: Option<bool>,
    connection_listeners: Option<Vec<Arc<dyn ConnectionListener>>>,
    channel_listeners: Option<Vec<Arc<dyn ChannelListener>>>,
    consumer_listeners: Option<Vec<Arc<dyn ConsumerListener>>>,
    listener_errors_fatal: Option<bool>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("connection_retry_policy", &self.connection_retry_policy())
            .field("connection_recovery_policy", &self.connection_recovery_policy())
            .field("channel_retry_policy", &self.channel_retry_policy())
            .field("channel_recovery_policy", &self.channel_recovery_policy())
            .field("exchange_recovery", &self.is_exchange_recovery_enabled())
            .field("queue_recovery", &self.is_queue_recovery_enabled())
            .field("consumer_recovery", &self.is_consumer_recovery_enabled())
            .field("listener_errors_fatal", &self.listener_errors_fatal())
            .finish()
    }
}

impl Config {
    /// No retries, no recovery.
    pub fn new() -> Config {
        Config::default()
    }

    /// A config falling back to `parent` for everything not set on it.
    pub fn child_of(parent: Arc<Config>) -> Config {
        Config {
            parent: Some(parent),
            ..Config::default()
        }
    }

    /// Retries every retryable failure and recovers from every closure.
    pub fn recover_always() -> Config {
        Config::new()
            .with_retry_policy(RetryPolicy::always())
            .with_recovery_policy(RecoveryPolicy::always())
    }

    /// Neither retries nor recovers.
    pub fn recover_never() -> Config {
        Config::new()
            .with_retry_policy(RetryPolicy::never())
            .with_recovery_policy(RecoveryPolicy::never())
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = Some(policy);
        self
    }

    /// Policy for the very first connection attempt.
    pub fn with_connect_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry_policy = Some(policy);
        self
    }

    pub fn with_connection_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.connection_retry_policy = Some(policy);
        self
    }

    pub fn with_connection_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.connection_recovery_policy = Some(policy);
        self
    }

    pub fn with_channel_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.channel_retry_policy = Some(policy);
        self
    }

    pub fn with_channel_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.channel_recovery_policy = Some(policy);
        self
    }

    pub fn with_exchange_recovery(mut self, enabled: bool) -> Self {
        self.exchange_recovery = Some(enabled);
        self
    }

    pub fn with_queue_recovery(mut self, enabled: bool) -> Self {
        self.queue_recovery = Some(enabled);
        self
    }

    pub fn with_consumer_recovery(mut self, enabled: bool) -> Self {
        self.consumer_recovery = Some(enabled);
        self
    }

    pub fn with_connection_listeners(mut self, listeners: Vec<Arc<dyn ConnectionListener>>) -> Self {
        self.connection_listeners = Some(listeners);
        self
    }

    pub fn with_channel_listeners(mut self, listeners: Vec<Arc<dyn ChannelListener>>) -> Self {
        self.channel_listeners = Some(listeners);
        self
    }

    pub fn with_consumer_listeners(mut self, listeners: Vec<Arc<dyn ConsumerListener>>) -> Self {
        self.consumer_listeners = Some(listeners);
        self
    }

    /// Makes a failing listener fail the recovery attempt that notified it.
    pub fn with_listener_errors_fatal(mut self, fatal: bool) -> Self {
        self.listener_errors_fatal = Some(fatal);
        self
    }

    fn inherit<T>(&self, pick: &dyn Fn(&Config) -> Option<T>) -> Option<T> {
        pick(self).or_else(|| self.parent.as_ref().and_then(|parent| parent.inherit(pick)))
    }

    /// Policy for the initial connection, falling back to the connection retry policy.
    pub fn connect_retry_policy(&self) -> RetryPolicy {
        self.inherit(&|config| config.connect_retry_policy.clone())
            .unwrap_or_else(|| self.connection_retry_policy())
    }

    pub fn connection_retry_policy(&self) -> RetryPolicy {
        self.inherit(&|config| {
            config
                .connection_retry_policy
                .clone()
                .or_else(|| config.retry_policy.clone())
        })
        .unwrap_or_else(RetryPolicy::never)
    }

    pub fn connection_recovery_policy(&self) -> RecoveryPolicy {
        self.inherit(&|config| {
            config
                .connection_recovery_policy
                .clone()
                .or_else(|| config.recovery_policy.clone())
        })
        .unwrap_or_else(RecoveryPolicy::never)
    }

    pub fn channel_retry_policy(&self) -> RetryPolicy {
        self.inherit(&|config| {
            config
                .channel_retry_policy
                .clone()
                .or_else(|| config.retry_policy.clone())
        })
        .unwrap_or_else(RetryPolicy::never)
    }

    pub fn channel_recovery_policy(&self) -> RecoveryPolicy {
        self.inherit(&|config| {
            config
                .channel_recovery_policy
                .clone()
                .or_else(|| config.recovery_policy.clone())
        })
        .unwrap_or_else(RecoveryPolicy::never)
    }

    pub fn is_exchange_recovery_enabled(&self) -> bool {
        self.inherit(&|config| config.exchange_recovery)
            .unwrap_or_else(|| self.channel_recovery_policy().allows_attempts())
    }

    pub fn is_queue_recovery_enabled(&self) -> bool {
        self.inherit(&|config| config.queue_recovery)
            .unwrap_or_else(|| self.channel_recovery_policy().allows_attempts())
    }

    pub fn is_consumer_recovery_enabled(&self) -> bool {
        self.inherit(&|config| config.consumer_recovery)
            .unwrap_or_else(|| self.channel_recovery_policy().allows_attempts())
    }

    pub fn listener_errors_fatal(&self) -> bool {
        self.inherit(&|config| config.listener_errors_fatal)
            .unwrap_or(false)
    }

    pub fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.inherit(&|config| config.connection_listeners.clone())
            .unwrap_or_default()
    }

    pub fn channel_listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.inherit(&|config| config.channel_listeners.clone())
            .unwrap_or_default()
    }

    pub fn consumer_listeners(&self) -> Vec<Arc<dyn ConsumerListener>> {
        self.inherit(&|config| config.consumer_listeners.clone())
            .unwrap_or_default()
    }
}

/// A policy as it appears in a settings file, durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "infinite_attempts")]
    pub max_attempts: i32,
    pub max_duration_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub multiplier: Option<u32>,
}

fn infinite_attempts() -> i32 {
    INFINITE_ATTEMPTS
}

impl TryFrom<&PolicySettings> for RecurringPolicy {
    type Error = PolicyError;

    fn try_from(settings: &PolicySettings) -> Result<Self, Self::Error> {
        if settings.max_attempts < INFINITE_ATTEMPTS {
            return Err(PolicyError::InvalidMaxAttempts(settings.max_attempts));
        }
        let mut policy = RecurringPolicy::new().with_max_attempts(settings.max_attempts);
        if let Some(max_duration) = settings.max_duration_ms {
            policy = policy.with_max_duration(Duration::from_millis(max_duration));
        }
        policy = match (settings.interval_ms, settings.max_interval_ms) {
            (Some(interval), Some(max_interval)) => policy.with_backoff_multiplier(
                Duration::from_millis(interval),
                Duration::from_millis(max_interval),
                settings.multiplier.unwrap_or(2),
            )?,
            (Some(interval), None) => policy.with_interval(Duration::from_millis(interval))?,
            (None, Some(_)) => return Err(PolicyError::NonPositiveInterval),
            (None, None) => policy,
        };
        Ok(policy)
    }
}

/// Serializable form of a [`Config`] without listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub retry: Option<PolicySettings>,
    pub recovery: Option<PolicySettings>,
    pub connect_retry: Option<PolicySettings>,
    pub connection_retry: Option<PolicySettings>,
    pub connection_recovery: Option<PolicySettings>,
    pub channel_retry: Option<PolicySettings>,
    pub channel_recovery: Option<PolicySettings>,
    pub exchange_recovery: Option<bool>,
    pub queue_recovery: Option<bool>,
    pub consumer_recovery: Option<bool>,
    pub listener_errors_fatal: Option<bool>,
}

fn policy(settings: &Option<PolicySettings>) -> Result<Option<RecurringPolicy>, PolicyError> {
    settings.as_ref().map(RecurringPolicy::try_from).transpose()
}

impl RecoverySettings {
    pub fn from_json(json: &str) -> Result<RecoverySettings, AmqpError> {
        serde_json::from_str(json).map_err(|err| AmqpError::InvalidConfig(err.to_string()))
    }

    pub fn into_config(self) -> Result<Config, AmqpError> {
        Ok(Config {
            retry_policy: policy(&self.retry)?,
            recovery_policy: policy(&self.recovery)?,
            connect_retry_policy: policy(&self.connect_retry)?,
            connection_retry_policy: policy(&self.connection_retry)?,
            connection_recovery_policy: policy(&self.connection_recovery)?,
            channel_retry_policy: policy(&self.channel_retry)?,
            channel_recovery_policy: policy(&self.channel_recovery)?,
            exchange_recovery: self.exchange_recovery,
            queue_recovery: self.queue_recovery,
            consumer_recovery: self.consumer_recovery,
            listener_errors_fatal: self.listener_errors_fatal,
            ..Config::default()
        })
    }
}
