//! # topiq
//!
//! Resilient publish/subscribe over a topic-exchange message broker.
//!
//! ## Overview
//!
//! Producers emit named events with arbitrary payloads; consumers bind
//! handlers to event-name patterns on shared or anonymous queues. topiq owns
//! everything in between:
//!
//! - **Lazy connections**: nothing connects until the first emit or consume,
//!   and closed connections or channels are replaced on next use
//! - **Retry**: connecting retries forever with a fixed delay plus jitter;
//!   publishing retries stale connections a few times without delay
//! - **Self-healing publish**: a deleted exchange is redeclared and the
//!   message published once more
//! - **Overlapping subscriptions**: several handlers on one queue are
//!   dispatched through a switch that runs every one whose pattern matches
//! - **Isolation**: a failing or panicking handler is logged and never stops
//!   the consume loop or its siblings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use topiq::prelude::*;
//!
//! # async fn run() -> topiq::Result<()> {
//! let broker = MemoryBroker::new();
//! let config = Config::new().with_url("memory://local").with_exchange("shop");
//!
//! let mut subscriber = Subscriber::new(config.clone(), Arc::new(broker.clone()))?;
//! subscriber.bind_fn(["order.*"], BindOptions::new().queue("orders"), |event, payload, _props| {
//!     println!("{}: {}", event, payload);
//!     Ok(())
//! })?;
//! let consumer = subscriber.spawn();
//!
//! let mut publisher = Publisher::new(config, Arc::new(broker))?;
//! publisher
//!     .emit("order.created", &serde_json::json!({"id": 42}), EmitOptions::new())
//!     .await?;
//!
//! consumer.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Broker capability
//!
//! The broker client is abstracted by the `topiq-broker` crate's
//! [`Connector`] trait. Its in-process [`MemoryBroker`] ships with the crate
//! and is what the test suites run against. Enable the `amqp` feature for
//! `AmqpConnector`, which connects to RabbitMQ or any other AMQP 0-9-1
//! broker.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod publisher;
pub mod pubsub;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod subscriber;
pub mod worker;

// Re-export main types for convenience
pub use config::Config;
pub use connection::{CloseHandle, ConnectionManager, ConnectionState};
pub use dispatch::{CallbackFailure, DispatchKind, DispatchOutcome};
pub use error::{Error, Result};
pub use listener::{EventListener, FnListener, HandlerResult};
pub use publisher::{EmitOptions, Envelope, Publisher};
pub use pubsub::PubSub;
pub use registry::{BindOptions, BindingKey, HandlerId};
pub use retry::{Jitter, RetryPolicy};
pub use serializer::{JsonSerializer, Serializer, SerializerError};
pub use subscriber::Subscriber;
pub use worker::ConsumerHandle;

// Re-export commonly used types from the broker crate
pub use topiq_broker::{
    matches, BrokerError, Connector, Delivery, Endpoint, Headers, MemoryBroker, Properties,
    TopicPattern,
};
#[cfg(feature = "amqp")]
pub use topiq_broker::AmqpConnector;

/// Prelude module for convenient imports
///
/// ```rust
/// use topiq::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BindOptions, Config, ConsumerHandle, EmitOptions, Error, EventListener, HandlerResult,
        MemoryBroker, Properties, PubSub, Publisher, Result, Subscriber,
    };
}
