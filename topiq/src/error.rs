//! Error types for the topiq crate.

use topiq_broker::BrokerError;

use crate::serializer::SerializerError;

/// Errors surfaced by publishers and subscribers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker could not be reached; retried before it is surfaced
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// A mandatory publish matched no queue
    #[error("Unroutable message: exchange '{exchange}', routing key '{routing_key}'")]
    Unroutable {
        /// Destination exchange
        exchange: String,
        /// Event name used as routing key
        routing_key: String,
    },

    /// The exchange was still missing after redeclaring it
    #[error("Exchange missing: {exchange}")]
    ExchangeMissing {
        /// The exchange that could not be published to
        exchange: String,
    },

    /// The broker closed the channel for any reason other than a missing exchange
    #[error("Channel closed by broker: {code} {reason}")]
    ChannelClosed {
        /// AMQP reply code
        code: u16,
        /// Reply text
        reason: String,
    },

    /// A payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializerError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A binding was rejected at registration
    #[error("Invalid binding: {0}")]
    InvalidBinding(String),

    /// Bindings cannot change once consuming has started
    #[error("Bindings are frozen once consuming has started")]
    BindingsFrozen,

    /// A background consumer task panicked or was aborted
    #[error("Consumer task failed: {0}")]
    Worker(String),

    /// Any other broker failure
    #[error("Broker error: {0}")]
    Broker(BrokerError),
}

impl Error {
    /// True for the transient class that retry policies act on.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_))
    }

    /// True when the broker shut the connection down on purpose.
    pub fn is_closed_by_broker(&self) -> bool {
        matches!(
            self,
            Error::Broker(BrokerError::ConnectionClosedByBroker { .. })
        )
    }
}

impl From<BrokerError> for Error {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::ConnectionFailed(message) => Error::ConnectionFailure(message),
            BrokerError::Unroutable {
                exchange,
                routing_key,
            } => Error::Unroutable {
                exchange,
                routing_key,
            },
            BrokerError::ChannelClosed { code, reason } => Error::ChannelClosed { code, reason },
            BrokerError::InvalidEndpoint(message) => Error::Configuration(message),
            other => Error::Broker(other),
        }
    }
}

/// Convenience type alias for Results using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
