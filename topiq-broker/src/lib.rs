//! Broker capability for topiq
//!
//! This crate defines the seam between topiq and a topic-exchange message
//! broker. A broker client is expressed as three layers of capability:
//!
//! - [`Connector`] opens a [`Connection`] to an [`Endpoint`]
//! - a [`Connection`] opens [`Channel`]s
//! - a [`Channel`] declares topology, publishes and delivers messages
//!
//! It also carries the topic matching rules in [`topic`] and an in-process
//! broker, [`MemoryBroker`], that implements the capability with the same
//! routing, ownership and error semantics as an AMQP 0-9-1 broker. With the
//! `amqp` feature, `AmqpConnector` talks to a real broker through `lapin`.

#[cfg(feature = "amqp")]
pub mod amqp;
mod error;
pub mod memory;
pub mod topic;
mod types;

pub use error::{
    BrokerError, CONNECTION_FORCED, NOT_FOUND, PRECONDITION_FAILED, RESOURCE_LOCKED,
};
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;
pub use topic::{matches, TopicPattern};
pub use types::{
    Delivery, DeliveryMode, Endpoint, ExchangeKind, Headers, Properties, QueueOptions,
};

use async_trait::async_trait;

/// Result alias for capability calls.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection. Unreachable brokers are reported as
    /// [`BrokerError::ConnectionFailed`].
    async fn connect(&self, endpoint: &Endpoint) -> BrokerResult<Box<dyn Connection>>;
}

/// A live session with the broker.
#[async_trait]
pub trait Connection: Send {
    fn is_open(&self) -> bool;

    async fn open_channel(&mut self) -> BrokerResult<Box<dyn Channel>>;

    async fn close(&mut self) -> BrokerResult<()>;
}

/// A channel on a connection. Not safe for concurrent use.
#[async_trait]
pub trait Channel: Send {
    fn is_open(&self) -> bool;

    /// Put the channel into publisher-confirms mode.
    async fn confirm_delivery(&mut self) -> BrokerResult<()>;

    /// Idempotently declare an exchange.
    async fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()>;

    /// Declare a queue and return its effective name. An empty name asks
    /// the broker to generate one.
    async fn queue_declare(&mut self, queue: &str, options: QueueOptions) -> BrokerResult<String>;

    async fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str)
        -> BrokerResult<()>;

    /// Publish a message. With `mandatory`, a message that reaches no queue
    /// is reported as [`BrokerError::Unroutable`]. Publishing to a missing
    /// exchange closes the channel with a 404 [`BrokerError::ChannelClosed`].
    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: &Properties,
        body: &[u8],
        mandatory: bool,
    ) -> BrokerResult<()>;

    /// Start consuming from a queue and return the consumer tag that
    /// deliveries for it will carry.
    async fn basic_consume(&mut self, queue: &str, auto_ack: bool) -> BrokerResult<String>;

    /// Wait for the next delivery on any consumer of this channel.
    ///
    /// Must be cancellation safe: dropping the future before it resolves
    /// loses no message.
    async fn next_delivery(&mut self) -> BrokerResult<Delivery>;

    async fn close(&mut self) -> BrokerResult<()>;
}
