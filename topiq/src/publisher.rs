//! Event publishing.
//!
//! [`Publisher::emit`] turns an event name and a payload into an [`Envelope`]
//! and publishes it to a durable topic exchange, with the event name as the
//! routing key. The publish path recovers on its own from:
//!
//! - a stale or dropped connection, by reconnecting and retrying up to the
//!   publish retry policy
//! - an exchange deleted behind its back, by redeclaring it and publishing
//!   once more
//! - an unroutable message that was not published as mandatory, by logging
//!   and dropping it
//!
//! Everything else is returned to the caller.

use std::sync::Arc;

use serde::Serialize;
use topiq_broker::{
    BrokerError, Channel, Connector, DeliveryMode, ExchangeKind, Headers, Properties,
};

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{Error, Result};
use crate::serializer::{Serializer, SerializerError};

/// Per-call publish options. Unset fields take the publisher's defaults.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub exchange: Option<String>,
    pub serializer: Option<Arc<dyn Serializer>>,
    /// Fail with [`Error::Unroutable`] when no queue receives the message
    pub mandatory: bool,
    pub correlation_id: Option<String>,
    pub headers: Option<Headers>,
    /// Ask the broker to persist the message
    pub persistent: bool,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// A fully built message, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub exchange: String,
    /// The event name
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
    pub mandatory: bool,
}

/// Publishes events over its own connection.
#[derive(Debug)]
pub struct Publisher {
    config: Config,
    connection: ConnectionManager,
}

impl Publisher {
    /// Create a publisher. No connection is made until the first emit.
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let connection =
            ConnectionManager::new(config.endpoint()?, connector, config.connect_retry);
        Ok(Self { config, connection })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Build the envelope `emit` would publish.
    pub fn envelope<T>(&self, event: &str, payload: &T, options: &EmitOptions) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        let serializer = options
            .serializer
            .as_ref()
            .unwrap_or(&self.config.serializer);

        let value =
            serde_json::to_value(payload).map_err(|e| SerializerError::Encode(e.to_string()))?;
        let body = serializer.encode(&value)?;

        let mut properties = Properties::default()
            .with_app_id(self.config.app_id.clone())
            .with_kind(event)
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64)
            .with_content_type(serializer.content_type());
        properties.correlation_id = options.correlation_id.clone();
        properties.headers = options.headers.clone();
        if options.persistent {
            properties.delivery_mode = Some(DeliveryMode::Persistent);
        }

        Ok(Envelope {
            exchange: self.config.exchange_or_default(options.exchange.as_deref()),
            routing_key: event.to_string(),
            properties,
            body,
            mandatory: options.mandatory,
        })
    }

    /// Publish `payload` as event `event`.
    pub async fn emit<T>(&mut self, event: &str, payload: &T, options: EmitOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope = self.envelope(event, payload, &options)?;
        tracing::info!(
            "Emitting event: event={} exchange={}",
            event,
            envelope.exchange
        );
        self.publish(&envelope).await
    }

    /// Publish a prepared envelope, retrying connection failures.
    pub async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let policy = self.config.publish_retry;
        let mut failed = 0u32;

        loop {
            match self.publish_once(envelope).await {
                Err(e) if e.is_connection_failure() => {
                    failed = failed.saturating_add(1);
                    let Some(delay) = policy.delay_for(failed) else {
                        return Err(e);
                    };
                    tracing::warn!(
                        "Publish of {} failed (attempt {}): {}; retrying",
                        envelope.routing_key,
                        failed,
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                other => return other,
            }
        }
    }

    /// Close the publisher's connection. The next emit reconnects.
    pub async fn close(&mut self) {
        self.connection.close().await;
    }

    async fn publish_once(&mut self, envelope: &Envelope) -> Result<()> {
        let channel = self.connection.ensure_channel().await?;
        declare_exchange(channel, &envelope.exchange).await?;

        match send(channel, envelope).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "Exchange {} missing on publish, redeclaring",
                    envelope.exchange
                );
                self.republish(envelope).await
            }
            Err(e) => unroutable_or(e, envelope),
        }
    }

    /// Redeclare the exchange on a fresh channel and publish once more.
    async fn republish(&mut self, envelope: &Envelope) -> Result<()> {
        let channel = self.connection.ensure_channel().await?;
        declare_exchange(channel, &envelope.exchange).await?;

        match send(channel, envelope).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::ExchangeMissing {
                exchange: envelope.exchange.clone(),
            }),
            Err(e) => unroutable_or(e, envelope),
        }
    }
}

async fn declare_exchange(channel: &mut dyn Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(exchange, ExchangeKind::Topic, true)
        .await?;
    Ok(())
}

async fn send(channel: &mut dyn Channel, envelope: &Envelope) -> std::result::Result<(), BrokerError> {
    channel
        .basic_publish(
            &envelope.exchange,
            &envelope.routing_key,
            &envelope.properties,
            &envelope.body,
            envelope.mandatory,
        )
        .await
}

/// Swallow a non-mandatory unroutable report; convert anything else.
fn unroutable_or(error: BrokerError, envelope: &Envelope) -> Result<()> {
    match error {
        BrokerError::Unroutable { .. } if !envelope.mandatory => {
            tracing::debug!("Message was unroutable: {}", error);
            Ok(())
        }
        other => Err(other.into()),
    }
}
