//! Error types for broker capability implementations

use thiserror::Error;

/// AMQP reply code for a missing exchange or queue.
pub const NOT_FOUND: u16 = 404;
/// AMQP reply code for an exclusive resource owned by another connection.
pub const RESOURCE_LOCKED: u16 = 405;
/// AMQP reply code for a redeclare with different arguments.
pub const PRECONDITION_FAILED: u16 = 406;
/// AMQP reply code for a normal connection shutdown.
pub const CONNECTION_FORCED: u16 = 320;

/// Errors reported by a broker connection or channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A mandatory publish matched no queue
    #[error("Message to exchange '{exchange}' with routing key '{routing_key}' was returned as unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// The broker closed the channel
    #[error("Channel closed by broker: {code} {reason}")]
    ChannelClosed { code: u16, reason: String },

    /// The broker closed the connection on purpose
    #[error("Connection closed by broker: {code} {reason}")]
    ConnectionClosedByBroker { code: u16, reason: String },

    /// The endpoint could not be parsed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Any other protocol-level failure
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// True for the transient "broker unreachable" class.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BrokerError::ConnectionFailed(_))
    }

    /// True when the broker closed the channel because an exchange or queue does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed { code, .. } if *code == NOT_FOUND)
    }
}
