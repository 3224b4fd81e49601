// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Recovery Layer
//!
//! This module provides the error vocabulary shared by the protocol client
//! traits, the lapin driver and the recovering handlers. Callers observe the
//! same variants whether an operation failed on the first attempt or after the
//! retry budget was used up.
//!
//! Broker-initiated closures are carried as a [`ShutdownSignal`], which records
//! the AMQP reply code and an explicit hard (connection) / soft (channel) flag.

use crate::policy::PolicyError;
use lapin::protocol::{AMQPError, AMQPErrorKind};
use std::{fmt, io};
use thiserror::Error;

/// Describes why a connection or channel was shut down.
///
/// A hard signal means the whole connection is gone, a soft one only affects
/// a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub reply_code: u16,
    pub reply_text: String,
    pub hard: bool,
    pub initiated_by_application: bool,
}

impl ShutdownSignal {
    /// A channel-level (soft) closure initiated by the broker.
    pub fn channel(reply_code: u16, reply_text: &str) -> ShutdownSignal {
        ShutdownSignal {
            reply_code,
            reply_text: reply_text.to_owned(),
            hard: false,
            initiated_by_application: false,
        }
    }

    /// A connection-level (hard) closure initiated by the broker.
    pub fn connection(reply_code: u16, reply_text: &str) -> ShutdownSignal {
        ShutdownSignal {
            reply_code,
            reply_text: reply_text.to_owned(),
            hard: true,
            initiated_by_application: false,
        }
    }

    /// A closure requested by the application itself.
    pub fn application(hard: bool) -> ShutdownSignal {
        ShutdownSignal {
            reply_code: 200,
            reply_text: "closed by application".to_owned(),
            hard,
            initiated_by_application: true,
        }
    }

    /// Returns whether the closure takes the whole connection down.
    pub fn is_hard_error(&self) -> bool {
        self.hard
    }

    /// Returns whether an invocation that failed with this signal may be retried.
    pub fn is_retryable(&self) -> bool {
        !self.initiated_by_application && is_retryable_reply_code(self.reply_code)
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} closed with reply code {} `{}`",
            if self.hard { "connection" } else { "channel" },
            self.reply_code,
            self.reply_text
        )
    }
}

impl From<&AMQPError> for ShutdownSignal {
    fn from(err: &AMQPError) -> Self {
        ShutdownSignal {
            reply_code: err.get_id(),
            reply_text: err.get_message().as_str().to_owned(),
            hard: matches!(err.kind(), AMQPErrorKind::Hard(_)),
            initiated_by_application: false,
        }
    }
}

/// Returns whether a broker reply code denotes a transient closure.
pub fn is_retryable_reply_code(reply_code: u16) -> bool {
    match reply_code {
        // channel: content too large
        311 => true,
        // channel: no consumers, access refused, not found, resource locked, precondition failed
        313 | 403 | 404 | 405 | 406 => false,
        // connection: connection forced
        320 => true,
        // connection: invalid path, frame/syntax/command/channel errors, unexpected frame,
        // resource error, not allowed, not implemented
        402 | 501 | 502 | 503 | 504 | 505 | 506 | 530 | 540 => false,
        // connection: internal error
        541 => true,
        _ => false,
    }
}

/// Represents errors that can occur while talking to the broker through the
/// recovering connection and channel handles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// No address of the connection options accepted a connection
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The broker closed the connection or the channel
    #[error("{0}")]
    Shutdown(ShutdownSignal),

    /// The resource was used after it was closed, by the broker or by the application
    #[error("{resource} already closed")]
    AlreadyClosed {
        resource: &'static str,
        signal: Option<ShutdownSignal>,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("connection refused `{0}`")]
    ConnectionRefused(String),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("i/o failure `{message}`")]
    Io { kind: io::ErrorKind, message: String },

    /// The broker rejected the credentials
    #[error("authentication failure `{0}`")]
    AuthenticationFailure(String),

    #[error("protocol failure `{0}`")]
    Protocol(String),

    /// A wait was interrupted because the resource was closed
    #[error("interrupted while waiting")]
    Interrupted,

    /// A listener failed while listener errors are configured to be fatal
    #[error("listener failure `{0}`")]
    ListenerError(String),

    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),

    #[error(transparent)]
    InvalidPolicy(#[from] PolicyError),
}

impl AmqpError {
    /// Error returned when an application-closed resource is used again.
    pub fn closed_by_application(resource: &'static str) -> AmqpError {
        AmqpError::AlreadyClosed {
            resource,
            signal: None,
        }
    }

    /// Extracts the embedded shutdown cause, if any.
    pub fn shutdown_signal(&self) -> Option<&ShutdownSignal> {
        match self {
            AmqpError::Shutdown(signal) => Some(signal),
            AmqpError::AlreadyClosed { signal, .. } => signal.as_ref(),
            _ => None,
        }
    }

    /// Returns whether the failure took the whole connection down.
    pub fn is_connection_closure(&self) -> bool {
        self.shutdown_signal().is_some_and(ShutdownSignal::is_hard_error)
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, AmqpError::AuthenticationFailure(_))
    }

    /// Returns whether the failure is a known transient condition.
    pub fn is_retryable(&self) -> bool {
        match self {
            AmqpError::Timeout | AmqpError::ConnectionRefused(_) | AmqpError::UnexpectedEof => {
                true
            }
            AmqpError::AlreadyClosed { signal, .. } => {
                signal.as_ref().is_some_and(|s| !s.initiated_by_application)
            }
            AmqpError::Shutdown(signal) => signal.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn from_io(kind: io::ErrorKind, message: String) -> AmqpError {
        match kind {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => AmqpError::Timeout,
            io::ErrorKind::ConnectionRefused => AmqpError::ConnectionRefused(message),
            io::ErrorKind::UnexpectedEof => AmqpError::UnexpectedEof,
            _ => AmqpError::Io { kind, message },
        }
    }
}

impl From<io::Error> for AmqpError {
    fn from(err: io::Error) -> Self {
        AmqpError::from_io(err.kind(), err.to_string())
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(amqp) => {
                let signal = ShutdownSignal::from(&amqp);
                if signal.hard && signal.reply_code == 403 {
                    AmqpError::AuthenticationFailure(signal.reply_text)
                } else {
                    AmqpError::Shutdown(signal)
                }
            }
            lapin::Error::IOError(io) => AmqpError::from_io(io.kind(), io.to_string()),
            lapin::Error::InvalidChannelState(_) => AmqpError::AlreadyClosed {
                resource: "channel",
                signal: Some(ShutdownSignal::channel(0, "channel is not connected")),
            },
            lapin::Error::InvalidConnectionState(_) | lapin::Error::MissingHeartbeatError => {
                AmqpError::AlreadyClosed {
                    resource: "connection",
                    signal: Some(ShutdownSignal::connection(0, "connection is not connected")),
                }
            }
            other => AmqpError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_table() {
        for code in [311, 320, 541] {
            assert!(is_retryable_reply_code(code), "{code} should be retryable");
        }
        for code in [313, 403, 404, 405, 406, 402, 501, 502, 503, 504, 505, 506, 530, 540] {
            assert!(!is_retryable_reply_code(code), "{code} should be fatal");
        }
        assert!(!is_retryable_reply_code(200));
    }

    #[test]
    fn transport_failures_are_retryable() {
        assert!(AmqpError::Timeout.is_retryable());
        assert!(AmqpError::ConnectionRefused("localhost:5672".into()).is_retryable());
        assert!(AmqpError::UnexpectedEof.is_retryable());
        assert!(AmqpError::from(io::Error::from(io::ErrorKind::TimedOut)).is_retryable());
        assert!(!AmqpError::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_retryable());
    }

    #[test]
    fn authentication_failures_never_retry() {
        let err = AmqpError::AuthenticationFailure("ACCESS_REFUSED".into());
        assert!(!err.is_retryable());
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn already_closed_depends_on_who_closed() {
        let by_broker = AmqpError::AlreadyClosed {
            resource: "channel",
            signal: Some(ShutdownSignal::channel(406, "PRECONDITION_FAILED")),
        };
        assert!(by_broker.is_retryable());
        assert!(!AmqpError::closed_by_application("channel").is_retryable());
    }

    #[test]
    fn shutdown_signal_classification() {
        let hard = AmqpError::Shutdown(ShutdownSignal::connection(320, "CONNECTION_FORCED"));
        assert!(hard.is_connection_closure());
        assert!(hard.is_retryable());

        let soft = AmqpError::Shutdown(ShutdownSignal::channel(404, "NOT_FOUND"));
        assert!(!soft.is_connection_closure());
        assert!(!soft.is_retryable());
        assert_eq!(soft.shutdown_signal().map(|s| s.reply_code), Some(404));

        assert!(!ShutdownSignal::application(true).is_retryable());
        assert!(AmqpError::Timeout.shutdown_signal().is_none());
    }
}
