//! AMQP 0-9-1 broker client backed by `lapin`.
//!
//! Enabled with the `amqp` feature. [`AmqpConnector`] dials `amqp://` and
//! `amqps://` endpoints and maps the client's errors onto [`BrokerError`]:
//!
//! - channel-level closes (404, 405, 406, ...) become [`BrokerError::ChannelClosed`]
//! - a broker-initiated connection close (320) becomes
//!   [`BrokerError::ConnectionClosedByBroker`]
//! - I/O errors, missed heartbeats and other lost connections become
//!   [`BrokerError::ConnectionFailed`]
//! - a mandatory message returned by the broker becomes
//!   [`BrokerError::Unroutable`]
//!
//! Consumers always run in auto-ack mode.

use std::fmt;

use async_trait::async_trait;
use futures::stream::{BoxStream, SelectAll, StreamExt};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::AMQPErrorKind;
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties};

use crate::error::{BrokerError, CONNECTION_FORCED};
use crate::types::{Delivery, DeliveryMode, Endpoint, ExchangeKind, Headers, Properties, QueueOptions};
use crate::{BrokerResult, Channel, Connection, Connector};

const REPLY_SUCCESS: u16 = 200;

/// Opens connections to an AMQP broker.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom client properties, such as a connection name.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

impl fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> BrokerResult<Box<dyn Connection>> {
        let scheme = endpoint.url().scheme();
        if scheme != "amqp" && scheme != "amqps" {
            return Err(BrokerError::InvalidEndpoint(format!(
                "{} is not an AMQP endpoint",
                endpoint
            )));
        }

        tracing::debug!("Dialing AMQP broker at {}", endpoint);
        let connection =
            lapin::Connection::connect(endpoint.url().as_str(), self.properties.clone())
                .await
                .map_err(broker_error)?;
        Ok(Box::new(AmqpConnection { inner: connection }))
    }
}

/// A `lapin` connection.
pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&mut self) -> BrokerResult<Box<dyn Channel>> {
        let channel = self.inner.create_channel().await.map_err(broker_error)?;
        Ok(Box::new(AmqpChannel {
            inner: channel,
            deliveries: SelectAll::new(),
        }))
    }

    async fn close(&mut self) -> BrokerResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(broker_error)
    }
}

type TaggedDeliveries = BoxStream<'static, (String, lapin::Result<lapin::message::Delivery>)>;

/// A `lapin` channel. Deliveries from all of its consumers are merged into
/// one stream, each tagged with the consumer it came from.
pub struct AmqpChannel {
    inner: lapin::Channel,
    deliveries: SelectAll<TaggedDeliveries>,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn confirm_delivery(&mut self) -> BrokerResult<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(exchange, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(broker_error)
    }

    async fn queue_declare(&mut self, queue: &str, options: QueueOptions) -> BrokerResult<String> {
        let declared = self
            .inner
            .queue_declare(queue, queue_declare_options(options), FieldTable::default())
            .await
            .map_err(broker_error)?;
        Ok(declared.name().as_str().to_string())
    }

    async fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: &Properties,
        body: &[u8],
        mandatory: bool,
    ) -> BrokerResult<()> {
        let options = BasicPublishOptions {
            mandatory,
            ..BasicPublishOptions::default()
        };
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, body, amqp_properties(properties))
            .await
            .map_err(broker_error)?;

        match confirm.await.map_err(broker_error)? {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
                Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
            Confirmation::Nack(None) => Err(BrokerError::Protocol(format!(
                "broker rejected message to {} with routing key {}",
                exchange, routing_key
            ))),
            _ => Ok(()),
        }
    }

    async fn basic_consume(&mut self, queue: &str, auto_ack: bool) -> BrokerResult<String> {
        if !auto_ack {
            return Err(BrokerError::Protocol(
                "manual acknowledgement is not supported".to_string(),
            ));
        }

        let tag = format!("topiq-{}", uuid::Uuid::new_v4().simple());
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await
            .map_err(broker_error)?;

        let stream_tag = tag.clone();
        self.deliveries
            .push(consumer.map(move |delivery| (stream_tag.clone(), delivery)).boxed());
        Ok(tag)
    }

    async fn next_delivery(&mut self) -> BrokerResult<Delivery> {
        match self.deliveries.next().await {
            Some((consumer_tag, Ok(delivery))) => Ok(to_delivery(consumer_tag, delivery)),
            Some((_, Err(e))) => Err(broker_error(e)),
            None => Err(BrokerError::ConnectionFailed(
                "every consumer on the channel has ended".to_string(),
            )),
        }
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.deliveries.clear();
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(broker_error)
    }
}

fn broker_error(error: lapin::Error) -> BrokerError {
    match &error {
        lapin::Error::ProtocolError(amqp) => {
            let code = amqp.get_id();
            let reason = amqp.get_message().as_str().to_string();
            match amqp.kind() {
                AMQPErrorKind::Soft(_) => BrokerError::ChannelClosed { code, reason },
                _ if code == CONNECTION_FORCED => {
                    BrokerError::ConnectionClosedByBroker { code, reason }
                }
                _ => BrokerError::ConnectionFailed(format!("{} {}", code, reason)),
            }
        }
        lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => BrokerError::ConnectionFailed(error.to_string()),
        _ => BrokerError::Protocol(error.to_string()),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn queue_declare_options(options: QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        ..QueueDeclareOptions::default()
    }
}

fn amqp_properties(properties: &Properties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(app_id) = &properties.app_id {
        amqp = amqp.with_app_id(app_id.as_str().into());
    }
    if let Some(kind) = &properties.kind {
        amqp = amqp.with_kind(kind.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(timestamp);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(content_type.as_str().into());
    }
    if let Some(mode) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(mode.as_u8());
    }
    if let Some(headers) = &properties.headers {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(key.as_str().into(), AMQPValue::LongString(value.clone().into()));
        }
        amqp = amqp.with_headers(table);
    }
    amqp
}

fn from_amqp_properties(amqp: &BasicProperties) -> Properties {
    let text = |value: &Option<lapin::types::ShortString>| {
        value.as_ref().map(|s| s.as_str().to_string())
    };

    Properties {
        app_id: text(amqp.app_id()),
        kind: text(amqp.kind()),
        timestamp: *amqp.timestamp(),
        correlation_id: text(amqp.correlation_id()),
        headers: amqp.headers().as_ref().map(headers_from_table),
        content_type: text(amqp.content_type()),
        delivery_mode: amqp.delivery_mode().and_then(|mode| match mode {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }),
    }
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                other => format!("{:?}", other),
            };
            (key.as_str().to_string(), value)
        })
        .collect()
}

fn to_delivery(consumer_tag: String, delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        consumer_tag,
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_amqp_properties(&delivery.properties),
        body: delivery.data,
    }
}
