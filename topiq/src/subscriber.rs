//! Event subscription and the consume loop.
//!
//! Handlers are bound up front with [`Subscriber::bind`]; nothing touches the
//! broker until [`Subscriber::consume`] runs. Consuming freezes the bindings,
//! declares every exchange and queue they need, binds each pattern, and then
//! dispatches deliveries one at a time until the broker shuts down, the
//! subscriber is closed, or an unrecoverable error occurs. Connection
//! failures restart the whole sequence after the connect retry delay.

use std::collections::HashMap;
use std::sync::Arc;

use topiq_broker::{BrokerError, Connector, ExchangeKind, TopicPattern};

use crate::config::Config;
use crate::connection::{CloseHandle, ConnectionManager, ConnectionState};
use crate::dispatch::{MessageHandler, QueueDispatcher};
use crate::error::{Error, Result};
use crate::listener::{EventListener, FnListener, HandlerResult};
use crate::registry::{BindOptions, BindingKey, BindingRegistry, HandlerId, QueuePlan};
use crate::worker::ConsumerHandle;

/// Consumes events over its own connection and dispatches them to bound
/// handlers.
pub struct Subscriber {
    config: Config,
    connection: ConnectionManager,
    registry: BindingRegistry,
    /// Computed once, when the registry is frozen
    plans: Option<Vec<QueuePlan>>,
    /// Consumer tag to dispatcher for the current channel
    consumers: HashMap<String, Arc<QueueDispatcher>>,
    /// Channel epoch the topology was last declared on
    materialized_epoch: Option<u64>,
}

impl Subscriber {
    /// Create a subscriber. No connection is made until consuming starts.
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let connection =
            ConnectionManager::new(config.endpoint()?, connector, config.connect_retry);
        Ok(Self {
            config,
            connection,
            registry: BindingRegistry::new(),
            plans: None,
            consumers: HashMap::new(),
            materialized_epoch: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Handle that stops a running [`consume`](Self::consume) from another task.
    pub fn close_handle(&self) -> CloseHandle {
        self.connection.close_handle()
    }

    /// Bind `listener` to one or more event patterns.
    ///
    /// Returns [`Error::InvalidBinding`] for an empty pattern list and
    /// [`Error::BindingsFrozen`] once consuming has started.
    pub fn bind<P, L>(&mut self, patterns: P, options: BindOptions, listener: L) -> Result<HandlerId>
    where
        P: IntoIterator,
        P::Item: Into<TopicPattern>,
        L: EventListener + 'static,
    {
        self.register(patterns, options, Arc::new(listener))
    }

    /// Bind a plain closure to one or more event patterns.
    pub fn bind_fn<P, F>(&mut self, patterns: P, options: BindOptions, f: F) -> Result<HandlerId>
    where
        P: IntoIterator,
        P::Item: Into<TopicPattern>,
        F: Fn(&str, &serde_json::Value, &topiq_broker::Properties) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.bind(patterns, options, FnListener::new(f))
    }

    /// Bind an already shared listener.
    pub fn register<P>(
        &mut self,
        patterns: P,
        options: BindOptions,
        listener: Arc<dyn EventListener>,
    ) -> Result<HandlerId>
    where
        P: IntoIterator,
        P::Item: Into<TopicPattern>,
    {
        let patterns: Vec<TopicPattern> = patterns.into_iter().map(Into::into).collect();
        let key = BindingKey::new(
            self.config.exchange_or_default(options.exchange.as_deref()),
            self.config.queue_or_default(options.queue.as_deref()),
        );
        let exclusive = options.exclusive.unwrap_or(self.config.default_exclusive);
        let serializer = options
            .serializer
            .unwrap_or_else(|| Arc::clone(&self.config.serializer));

        let names: Vec<&str> = patterns.iter().map(TopicPattern::as_str).collect();
        tracing::info!("Late-binding handler to events {:?} from {}", names, key);

        self.registry.insert(
            key,
            patterns,
            exclusive,
            MessageHandler::new(listener, serializer),
        )
    }

    /// Declare the bound topology on the current channel and start a consumer
    /// per queue. A no-op when already done on this channel.
    pub async fn materialize(&mut self) -> Result<()> {
        if self.plans.is_none() {
            self.registry.freeze();
            self.plans = Some(self.registry.plan());
        }

        self.connection.ensure_channel().await?;
        let epoch = self.connection.channel_epoch();
        if self.materialized_epoch == Some(epoch) {
            tracing::debug!("Bindings already applied on this channel");
            return Ok(());
        }

        let channel = self.connection.ensure_channel().await?;
        let plans = self.plans.as_deref().unwrap_or_default();
        self.consumers.clear();

        for plan in plans {
            channel
                .exchange_declare(&plan.key.exchange, ExchangeKind::Topic, true)
                .await?;
            let queue = channel.queue_declare(&plan.key.queue, plan.options).await?;

            for routing_key in &plan.routing_keys {
                channel
                    .queue_bind(&queue, &plan.key.exchange, routing_key)
                    .await?;
            }

            let tag = channel.basic_consume(&queue, true).await?;
            tracing::info!(
                "Consuming queue {} from exchange {} with {:?} dispatch over {} binding(s)",
                queue,
                plan.key.exchange,
                plan.dispatcher.kind(),
                plan.dispatcher.bindings().len()
            );
            self.consumers.insert(tag, Arc::clone(&plan.dispatcher));
        }

        self.materialized_epoch = Some(epoch);
        Ok(())
    }

    /// Consume until the broker closes the connection or the subscriber is
    /// closed. Connection failures are retried with the connect policy.
    pub async fn consume(&mut self) -> Result<()> {
        let close = self.close_handle();
        let policy = self.config.connect_retry;
        let mut failed = 0u32;

        loop {
            match self.consume_once(&close, &mut failed).await {
                Err(e) if e.is_connection_failure() => {
                    failed = failed.saturating_add(1);
                    let Some(delay) = policy.delay_for(failed) else {
                        return Err(e);
                    };
                    tracing::warn!(
                        "Consumer lost its connection (attempt {}): {}; retrying in {:?}",
                        failed,
                        e,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = close.wait() => return self.stop(&close).await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Close the connection. A later [`consume`](Self::consume) reconnects
    /// and redeclares the topology.
    pub async fn close(&mut self) {
        self.connection.close().await;
    }

    /// Run [`consume`](Self::consume) on a background task.
    pub fn spawn(mut self) -> ConsumerHandle {
        let close = self.close_handle();
        let task = tokio::spawn(async move { self.consume().await });
        ConsumerHandle::new(close, task)
    }

    /// One connect, declare and deliver cycle. `failed` is cleared once the
    /// topology is in place, so only consecutive failures count against the
    /// retry policy.
    async fn consume_once(&mut self, close: &CloseHandle, failed: &mut u32) -> Result<()> {
        let prepared = tokio::select! {
            biased;
            _ = close.wait() => None,
            result = self.materialize() => Some(result),
        };
        match prepared {
            None => return self.stop(close).await,
            Some(Err(e)) if e.is_closed_by_broker() => {
                tracing::info!("{} while declaring bindings, stopping consumer", e);
                self.connection.close().await;
                return Ok(());
            }
            Some(result) => result?,
        }
        *failed = 0;

        if self.consumers.is_empty() {
            tracing::warn!("No bindings registered, nothing to consume");
            return Ok(());
        }

        loop {
            let Some(channel) = self.connection.current_channel() else {
                return Err(Error::ConnectionFailure("consumer channel is gone".to_string()));
            };

            let next = tokio::select! {
                biased;
                _ = close.wait() => None,
                delivery = channel.next_delivery() => Some(delivery),
            };

            let delivery = match next {
                None => return self.stop(close).await,
                Some(Ok(delivery)) => delivery,
                Some(Err(BrokerError::ConnectionClosedByBroker { code, reason })) => {
                    tracing::info!(
                        "Connection closed by broker ({} {}), stopping consumer",
                        code,
                        reason
                    );
                    self.connection.close().await;
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
            };

            match self.consumers.get(&delivery.consumer_tag) {
                Some(dispatcher) => {
                    dispatcher.dispatch(&delivery).await;
                }
                None => tracing::warn!(
                    "Dropping delivery for unknown consumer {}",
                    delivery.consumer_tag
                ),
            }
        }
    }

    async fn stop(&mut self, close: &CloseHandle) -> Result<()> {
        close.take();
        tracing::info!("Close requested, stopping consumer");
        self.connection.close().await;
        Ok(())
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("connection", &self.connection)
            .field("keys", &self.registry.len())
            .field("frozen", &self.registry.is_frozen())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchKind;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::time::Duration;
    use topiq_broker::{
        BrokerResult, Channel, Connection, Delivery, Endpoint, MemoryBroker, Properties,
        QueueOptions, CONNECTION_FORCED,
    };

    fn config() -> Config {
        Config::new()
            .with_url("memory://test")
            .with_exchange("events")
            .with_connect_retry(RetryPolicy::never())
    }

    fn subscriber(broker: &MemoryBroker) -> Subscriber {
        Subscriber::new(config(), Arc::new(broker.clone())).unwrap()
    }

    fn noop(_: &str, _: &serde_json::Value, _: &topiq_broker::Properties) -> HandlerResult {
        Ok(())
    }

    #[test]
    fn test_bind_applies_defaults() {
        let broker = MemoryBroker::new();
        let mut subscriber = Subscriber::new(
            config().with_queue("orders").with_exclusive(true),
            Arc::new(broker),
        )
        .unwrap();

        subscriber
            .bind_fn(["order.*"], BindOptions::new(), noop)
            .unwrap();
        subscriber
            .bind_fn(["audit.#"], BindOptions::new().queue("").exchange("audit"), noop)
            .unwrap();

        let keys: Vec<&BindingKey> = subscriber.registry().keys().collect();
        assert_eq!(keys[0], &BindingKey::new("events", "orders"));
        assert_eq!(keys[1], &BindingKey::new("audit", "orders"));

        let bindings = subscriber
            .registry()
            .bindings(&BindingKey::new("events", "orders"))
            .unwrap();
        assert!(bindings[0].is_exclusive());
    }

    #[test]
    fn test_bind_rejects_no_patterns() {
        let mut subscriber = subscriber(&MemoryBroker::new());
        let err = subscriber
            .bind_fn(Vec::<String>::new(), BindOptions::new(), noop)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBinding(_)));
    }

    #[tokio::test]
    async fn test_materialize_declares_topology_once() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker);
        subscriber
            .bind_fn(["order.created", "order.paid"], BindOptions::new().queue("orders"), noop)
            .unwrap();
        subscriber
            .bind_fn(["order.created"], BindOptions::new().queue("orders"), noop)
            .unwrap();

        subscriber.materialize().await.unwrap();
        subscriber.materialize().await.unwrap();

        let queue = broker.queue("orders").unwrap();
        assert_eq!(queue.options, QueueOptions::durable());
        assert_eq!(queue.consumers, 1);
        assert_eq!(
            broker.routing_keys("orders"),
            vec!["order.created".to_string(), "order.paid".to_string()]
        );

        let dispatcher = subscriber.consumers.values().next().unwrap();
        assert_eq!(dispatcher.kind(), DispatchKind::Switch);

        let err = subscriber
            .bind_fn(["late"], BindOptions::new(), noop)
            .unwrap_err();
        assert!(matches!(err, Error::BindingsFrozen));
    }

    #[tokio::test]
    async fn test_anonymous_queue_is_exclusive_and_server_named() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker);
        subscriber
            .bind_fn(["audit.#"], BindOptions::new(), noop)
            .unwrap();

        subscriber.materialize().await.unwrap();

        let names = broker.queue_names();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("amq.gen-"));
        assert_eq!(broker.queue(&names[0]).unwrap().options, QueueOptions::exclusive());
        assert_eq!(broker.routing_keys(&names[0]), vec!["audit.#".to_string()]);
    }

    #[tokio::test]
    async fn test_consume_without_bindings_returns() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker);
        subscriber.consume().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_requested_before_consume() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker);
        subscriber
            .bind_fn(["a"], BindOptions::new().queue("q"), noop)
            .unwrap();

        subscriber.close_handle().close();
        subscriber.consume().await.unwrap();
        assert_eq!(subscriber.state(), ConnectionState::Disconnected);
        assert!(!subscriber.close_handle().is_requested());
    }

    #[tokio::test]
    async fn test_broker_shutdown_ends_consume() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker);
        subscriber
            .bind_fn(["a"], BindOptions::new().queue("q"), noop)
            .unwrap();

        let admin = broker.clone();
        tokio::spawn(async move {
            while admin.queue("q").map_or(0, |q| q.consumers) == 0 {
                tokio::task::yield_now().await;
            }
            admin.shutdown_gracefully();
        });

        subscriber.consume().await.unwrap();
        assert_eq!(subscriber.state(), ConnectionState::Disconnected);
    }

    async fn wait_for_consumer(broker: &MemoryBroker, queue: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.queue(queue).map_or(0, |q| q.consumers) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("consumer never came back");
    }

    #[tokio::test]
    async fn test_recovered_outages_do_not_use_up_retries() {
        let broker = MemoryBroker::new();
        let mut subscriber = Subscriber::new(
            config().with_connect_retry(RetryPolicy::bounded(2, Duration::from_millis(5))),
            Arc::new(broker.clone()),
        )
        .unwrap();
        subscriber
            .bind_fn(["a"], BindOptions::new().queue("q"), noop)
            .unwrap();
        let consumer = subscriber.spawn();

        for _ in 0..3 {
            wait_for_consumer(&broker, "q").await;
            broker.drop_connections();
        }
        wait_for_consumer(&broker, "q").await;
        assert!(!consumer.is_finished());

        consumer.shutdown().await.unwrap();
    }

    /// Delegates to a [`MemoryBroker`] but has the broker shut down as soon
    /// as a queue is declared.
    struct ShutdownOnDeclare(MemoryBroker);

    struct ShutdownConnection(Box<dyn Connection>);

    struct ShutdownChannel(Box<dyn Channel>);

    #[async_trait]
    impl Connector for ShutdownOnDeclare {
        async fn connect(&self, endpoint: &Endpoint) -> BrokerResult<Box<dyn Connection>> {
            let inner = self.0.connect(endpoint).await?;
            Ok(Box::new(ShutdownConnection(inner)))
        }
    }

    #[async_trait]
    impl Connection for ShutdownConnection {
        fn is_open(&self) -> bool {
            self.0.is_open()
        }

        async fn open_channel(&mut self) -> BrokerResult<Box<dyn Channel>> {
            let inner = self.0.open_channel().await?;
            Ok(Box::new(ShutdownChannel(inner)))
        }

        async fn close(&mut self) -> BrokerResult<()> {
            self.0.close().await
        }
    }

    #[async_trait]
    impl Channel for ShutdownChannel {
        fn is_open(&self) -> bool {
            self.0.is_open()
        }

        async fn confirm_delivery(&mut self) -> BrokerResult<()> {
            self.0.confirm_delivery().await
        }

        async fn exchange_declare(
            &mut self,
            exchange: &str,
            kind: ExchangeKind,
            durable: bool,
        ) -> BrokerResult<()> {
            self.0.exchange_declare(exchange, kind, durable).await
        }

        async fn queue_declare(&mut self, _queue: &str, _options: QueueOptions) -> BrokerResult<String> {
            Err(BrokerError::ConnectionClosedByBroker {
                code: CONNECTION_FORCED,
                reason: "broker forced connection closure".to_string(),
            })
        }

        async fn queue_bind(
            &mut self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> BrokerResult<()> {
            self.0.queue_bind(queue, exchange, routing_key).await
        }

        async fn basic_publish(
            &mut self,
            exchange: &str,
            routing_key: &str,
            properties: &Properties,
            body: &[u8],
            mandatory: bool,
        ) -> BrokerResult<()> {
            self.0
                .basic_publish(exchange, routing_key, properties, body, mandatory)
                .await
        }

        async fn basic_consume(&mut self, queue: &str, auto_ack: bool) -> BrokerResult<String> {
            self.0.basic_consume(queue, auto_ack).await
        }

        async fn next_delivery(&mut self) -> BrokerResult<Delivery> {
            self.0.next_delivery().await
        }

        async fn close(&mut self) -> BrokerResult<()> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_broker_shutdown_during_setup_ends_consume() {
        let broker = MemoryBroker::new();
        let mut subscriber = Subscriber::new(
            config().with_connect_retry(RetryPolicy::default()),
            Arc::new(ShutdownOnDeclare(broker.clone())),
        )
        .unwrap();
        subscriber
            .bind_fn(["a"], BindOptions::new().queue("q"), noop)
            .unwrap();

        subscriber.consume().await.unwrap();
        assert_eq!(subscriber.state(), ConnectionState::Disconnected);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_non_connection_errors_propagate() {
        let broker = MemoryBroker::new();
        let mut owner = subscriber(&broker);
        owner
            .bind_fn(["a"], BindOptions::new().queue("locked").exclusive(true), noop)
            .unwrap();
        owner.materialize().await.unwrap();

        let mut other = subscriber(&broker);
        other
            .bind_fn(["a"], BindOptions::new().queue("locked").exclusive(true), noop)
            .unwrap();

        let err = other.consume().await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { code: 405, .. }));
    }
}
