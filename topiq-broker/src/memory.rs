//! In-process topic-exchange broker.
//!
//! [`MemoryBroker`] implements [`Connector`] and keeps every exchange, queue,
//! binding and connection in shared memory. Routing, exclusive ownership and
//! channel-closing errors follow AMQP 0-9-1 so code written against the
//! capability traits behaves the same way here as against a real broker.
//!
//! Besides the capability, the broker exposes administrative knobs for
//! simulating outages (refused connects, dropped connections, a graceful
//! broker shutdown, injected publish faults) and read-only views of its
//! topology and of every message published to it.
//!
//! Consumers always run in auto-ack mode: a message is removed from its
//! queue as soon as it is handed out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{
    BrokerError, CONNECTION_FORCED, NOT_FOUND, PRECONDITION_FAILED, RESOURCE_LOCKED,
};
use crate::topic::matches;
use crate::types::{Delivery, Endpoint, ExchangeKind, Properties, QueueOptions};
use crate::{BrokerResult, Channel, Connection, Connector};

/// A failure the broker will produce on the next publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishFault {
    /// The connection drops while publishing
    ConnectionLost,
    /// The exchange vanished between declare and publish
    ExchangeNotFound,
    /// The broker closes the channel with the given reply
    ChannelClosed { code: u16, reason: String },
}

/// Snapshot of a declared exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Snapshot of a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub options: QueueOptions,
    /// Messages waiting to be delivered
    pub messages: usize,
    pub consumers: usize,
    /// Id of the connection that owns an exclusive queue
    pub exclusive_owner: Option<u64>,
}

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Journal entry for every publish that reached an existing exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
    pub mandatory: bool,
    /// Queues the message was copied to
    pub routed_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkStatus {
    Open,
    /// Closed by the client
    Closed,
    /// Dropped by the network
    Lost,
    ClosedByBroker { code: u16, reason: String },
}

#[derive(Debug)]
struct ChannelSlot {
    connection: u64,
    open: bool,
    confirms: bool,
    closed_by_broker: Option<(u16, String)>,
}

#[derive(Debug)]
struct QueuedMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Vec<u8>,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<QueuedMessage>,
    had_consumer: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    queue: String,
    channel: u64,
    connection: u64,
}

#[derive(Debug, Default)]
struct State {
    offline: bool,
    refuse_connects: u32,
    connect_attempts: u64,
    publish_faults: VecDeque<PublishFault>,
    exchanges: HashMap<String, ExchangeInfo>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingInfo>,
    consumers: HashMap<String, ConsumerSlot>,
    connections: HashMap<u64, LinkStatus>,
    channels: HashMap<u64, ChannelSlot>,
    journal: Vec<PublishedMessage>,
    next_id: u64,
    next_seq: u64,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_is_open(&self, connection: u64) -> bool {
        matches!(self.connections.get(&connection), Some(LinkStatus::Open))
    }

    /// Error to report for an operation on `channel`, if it is unusable.
    fn check_channel(&self, channel: u64) -> BrokerResult<()> {
        let slot = self
            .channels
            .get(&channel)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown channel {}", channel)))?;

        match self.connections.get(&slot.connection) {
            Some(LinkStatus::Open) => {}
            Some(LinkStatus::Lost) | None => {
                return Err(BrokerError::ConnectionFailed(
                    "connection to broker was lost".to_string(),
                ))
            }
            Some(LinkStatus::ClosedByBroker { code, reason }) => {
                return Err(BrokerError::ConnectionClosedByBroker {
                    code: *code,
                    reason: reason.clone(),
                })
            }
            Some(LinkStatus::Closed) => {
                return Err(BrokerError::Protocol("connection is closed".to_string()))
            }
        }

        if slot.open {
            return Ok(());
        }

        match &slot.closed_by_broker {
            Some((code, reason)) => Err(BrokerError::ChannelClosed {
                code: *code,
                reason: reason.clone(),
            }),
            None => Err(BrokerError::Protocol("channel is closed".to_string())),
        }
    }

    /// Close a channel from the broker side and return the matching error.
    fn fail_channel(&mut self, channel: u64, code: u16, reason: String) -> BrokerError {
        if let Some(slot) = self.channels.get_mut(&channel) {
            slot.open = false;
            slot.closed_by_broker = Some((code, reason.clone()));
        }
        self.release_consumers(|consumer| consumer.channel == channel);
        BrokerError::ChannelClosed { code, reason }
    }

    fn close_channel(&mut self, channel: u64) {
        if let Some(slot) = self.channels.get_mut(&channel) {
            slot.open = false;
        }
        self.release_consumers(|consumer| consumer.channel == channel);
    }

    /// Move a connection out of the open state and drop everything it owned.
    fn end_connection(&mut self, connection: u64, status: LinkStatus) {
        match self.connections.get_mut(&connection) {
            Some(current) if *current == LinkStatus::Open => *current = status,
            _ => return,
        }

        for slot in self.channels.values_mut() {
            if slot.connection == connection {
                slot.open = false;
            }
        }
        self.release_consumers(|consumer| consumer.connection == connection);

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.remove_queue(&name);
        }
    }

    fn release_consumers(&mut self, predicate: impl Fn(&ConsumerSlot) -> bool) {
        let released: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| predicate(consumer))
            .map(|(tag, _)| tag.clone())
            .collect();

        let mut touched = Vec::new();
        for tag in released {
            if let Some(consumer) = self.consumers.remove(&tag) {
                touched.push(consumer.queue);
            }
        }

        for name in touched {
            let idle = self
                .queues
                .get(&name)
                .map(|queue| queue.options.auto_delete && queue.had_consumer)
                .unwrap_or(false)
                && !self.consumers.values().any(|consumer| consumer.queue == name);
            if idle {
                self.remove_queue(&name);
            }
        }
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|binding| binding.queue != name);
        self.consumers.retain(|_, consumer| consumer.queue != name);
    }

    fn locked_by_other(&self, queue: &str, connection: u64) -> bool {
        self.queues
            .get(queue)
            .and_then(|state| state.owner)
            .map(|owner| owner != connection)
            .unwrap_or(false)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        let kind = match self.exchanges.get(exchange) {
            Some(info) => info.kind,
            None => return Vec::new(),
        };

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Topic => matches(routing_key, &binding.routing_key),
                ExchangeKind::Direct => routing_key == binding.routing_key,
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    /// Pop the oldest message from any queue consumed on `channel`.
    fn take_delivery(&mut self, channel: u64) -> Option<Delivery> {
        let mut best: Option<(u64, String, String)> = None;
        for (tag, consumer) in &self.consumers {
            if consumer.channel != channel {
                continue;
            }
            let Some(queue) = self.queues.get(&consumer.queue) else {
                continue;
            };
            if let Some(front) = queue.messages.front() {
                if best.as_ref().map_or(true, |(seq, _, _)| front.seq < *seq) {
                    best = Some((front.seq, consumer.queue.clone(), tag.clone()));
                }
            }
        }

        let (_, queue, consumer_tag) = best?;
        let message = self.queues.get_mut(&queue)?.messages.pop_front()?;

        Some(Delivery {
            consumer_tag,
            delivery_tag: message.seq,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: false,
            properties: message.properties,
            body: message.body,
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    /// Apply a state change and wake every waiting consumer.
    fn update<R>(&self, change: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock();
        let result = change(&mut state);
        drop(state);
        self.notify.notify_waiters();
        result
    }
}

/// In-process topic-exchange broker.
///
/// Cloning is cheap; clones share the same broker state.
///
/// ```rust
/// use topiq_broker::{Connector, Endpoint, ExchangeKind, MemoryBroker, Properties};
///
/// # tokio_test_block_on(async {
/// let broker = MemoryBroker::new();
/// let endpoint = Endpoint::parse("memory://local").unwrap();
///
/// let mut connection = broker.connect(&endpoint).await.unwrap();
/// let mut channel = connection.open_channel().await.unwrap();
/// channel.exchange_declare("events", ExchangeKind::Topic, true).await.unwrap();
/// channel
///     .basic_publish("events", "order.created", &Properties::default(), b"{}", false)
///     .await
///     .unwrap();
///
/// assert_eq!(broker.published().len(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts with
    /// [`BrokerError::ConnectionFailed`].
    pub fn refuse_connects(&self, count: u32) {
        self.shared.update(|state| state.refuse_connects = count);
    }

    /// Take the broker off the network. Existing connections are dropped and
    /// new ones are refused until it comes back online.
    pub fn set_offline(&self, offline: bool) {
        self.shared.update(|state| {
            state.offline = offline;
            if offline {
                let open: Vec<u64> = open_connections(state);
                for id in open {
                    state.end_connection(id, LinkStatus::Lost);
                }
            }
        });
        tracing::debug!("Memory broker offline={}", offline);
    }

    /// Drop every open connection as a network failure would.
    pub fn drop_connections(&self) {
        self.shared.update(|state| {
            for id in open_connections(state) {
                state.end_connection(id, LinkStatus::Lost);
            }
        });
    }

    /// Close every open connection from the broker side, as a broker
    /// shutting down cleanly does.
    pub fn shutdown_gracefully(&self) {
        self.shared.update(|state| {
            for id in open_connections(state) {
                state.end_connection(
                    id,
                    LinkStatus::ClosedByBroker {
                        code: CONNECTION_FORCED,
                        reason: "CONNECTION_FORCED - broker forced connection closure".to_string(),
                    },
                );
            }
        });
    }

    /// Queue a fault for an upcoming publish. Faults are consumed in order,
    /// one per publish.
    pub fn inject_publish_fault(&self, fault: PublishFault) {
        self.shared
            .update(|state| state.publish_faults.push_back(fault));
    }

    /// Remove an exchange and its bindings.
    pub fn delete_exchange(&self, name: &str) -> bool {
        self.shared.update(|state| {
            state.bindings.retain(|binding| binding.exchange != name);
            state.exchanges.remove(name).is_some()
        })
    }

    /// Remove a queue, its bindings and its consumers.
    pub fn delete_queue(&self, name: &str) -> bool {
        self.shared.update(|state| {
            let existed = state.queues.contains_key(name);
            state.remove_queue(name);
            existed
        })
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeInfo> {
        self.shared.state.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueInfo> {
        let state = self.shared.state.lock();
        state.queues.get(name).map(|queue| QueueInfo {
            name: name.to_string(),
            options: queue.options,
            messages: queue.messages.len(),
            consumers: state
                .consumers
                .values()
                .filter(|consumer| consumer.queue == name)
                .count(),
            exclusive_owner: queue.owner,
        })
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<BindingInfo> {
        self.shared.state.lock().bindings.clone()
    }

    /// Routing keys bound to `queue`, in binding order.
    pub fn routing_keys(&self, queue: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| binding.routing_key.clone())
            .collect()
    }

    /// Every message published to an existing exchange, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().journal.clone()
    }

    /// Number of connection attempts seen, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.state.lock().connect_attempts
    }

    pub fn open_connection_count(&self) -> usize {
        open_connections(&self.shared.state.lock()).len()
    }

    /// Whether the channel with this id is in confirm mode.
    pub fn confirms_enabled(&self, channel: u64) -> bool {
        self.shared
            .state
            .lock()
            .channels
            .get(&channel)
            .map(|slot| slot.confirms)
            .unwrap_or(false)
    }
}

fn open_connections(state: &State) -> Vec<u64> {
    state
        .connections
        .iter()
        .filter(|(_, status)| **status == LinkStatus::Open)
        .map(|(id, _)| *id)
        .collect()
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> BrokerResult<Box<dyn Connection>> {
        let id = {
            let mut state = self.shared.state.lock();
            state.connect_attempts += 1;

            if state.offline {
                return Err(BrokerError::ConnectionFailed(format!(
                    "broker at {} is unreachable",
                    endpoint
                )));
            }
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(BrokerError::ConnectionFailed(format!(
                    "connection to {} refused",
                    endpoint
                )));
            }

            let id = state.allocate_id();
            state.connections.insert(id, LinkStatus::Open);
            id
        };

        tracing::debug!("Memory broker accepted connection {} for {}", id, endpoint);

        Ok(Box::new(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Connection handed out by [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.state.lock().connection_is_open(self.id)
    }

    async fn open_channel(&mut self) -> BrokerResult<Box<dyn Channel>> {
        let id = {
            let mut state = self.shared.state.lock();
            if !state.connection_is_open(self.id) {
                return Err(BrokerError::ConnectionFailed(
                    "cannot open a channel on a closed connection".to_string(),
                ));
            }

            let id = state.allocate_id();
            state.channels.insert(
                id,
                ChannelSlot {
                    connection: self.id,
                    open: true,
                    confirms: false,
                    closed_by_broker: None,
                },
            );
            id
        };

        Ok(Box::new(MemoryChannel {
            id,
            connection: self.id,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&mut self) -> BrokerResult<()> {
        let id = self.id;
        self.shared
            .update(|state| state.end_connection(id, LinkStatus::Closed));
        Ok(())
    }
}

/// Channel handed out by a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn try_next(&self) -> Option<BrokerResult<Delivery>> {
        let mut state = self.shared.state.lock();
        if let Err(e) = state.check_channel(self.id) {
            return Some(Err(e));
        }
        state.take_delivery(self.id).map(Ok)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.state.lock().check_channel(self.id).is_ok()
    }

    async fn confirm_delivery(&mut self) -> BrokerResult<()> {
        let mut state = self.shared.state.lock();
        state.check_channel(self.id)?;
        if let Some(slot) = state.channels.get_mut(&self.id) {
            slot.confirms = true;
        }
        Ok(())
    }

    async fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        let mut state = self.shared.state.lock();
        state.check_channel(self.id)?;

        if let Some(existing) = state.exchanges.get(exchange) {
            if existing.kind != kind || existing.durable != durable {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {} durable={}, existing {} durable={}",
                    exchange, kind, durable, existing.kind, existing.durable
                );
                return Err(state.fail_channel(self.id, PRECONDITION_FAILED, reason));
            }
            return Ok(());
        }

        state.exchanges.insert(
            exchange.to_string(),
            ExchangeInfo {
                name: exchange.to_string(),
                kind,
                durable,
            },
        );
        Ok(())
    }

    async fn queue_declare(&mut self, queue: &str, options: QueueOptions) -> BrokerResult<String> {
        let mut state = self.shared.state.lock();
        state.check_channel(self.id)?;

        let name = if queue.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            queue.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if state.locked_by_other(&name, self.connection) {
                let reason = format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name
                );
                return Err(state.fail_channel(self.id, RESOURCE_LOCKED, reason));
            }
            if existing.options.durable != options.durable
                || existing.options.exclusive != options.exclusive
                || existing.options.auto_delete != options.auto_delete
            {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    name
                );
                return Err(state.fail_channel(self.id, PRECONDITION_FAILED, reason));
            }
            return Ok(name);
        }

        let owner = options.exclusive.then_some(self.connection);
        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner,
                messages: VecDeque::new(),
                had_consumer: false,
            },
        );
        Ok(name)
    }

    async fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let mut state = self.shared.state.lock();
        state.check_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{}'", queue);
            return Err(state.fail_channel(self.id, NOT_FOUND, reason));
        }
        if !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{}'", exchange);
            return Err(state.fail_channel(self.id, NOT_FOUND, reason));
        }
        if state.locked_by_other(queue, self.connection) {
            let reason = format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                queue
            );
            return Err(state.fail_channel(self.id, RESOURCE_LOCKED, reason));
        }

        let binding = BindingInfo {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: &Properties,
        body: &[u8],
        mandatory: bool,
    ) -> BrokerResult<()> {
        let result = {
            let mut state = self.shared.state.lock();
            state.check_channel(self.id)?;

            match state.publish_faults.pop_front() {
                Some(PublishFault::ConnectionLost) => {
                    state.end_connection(self.connection, LinkStatus::Lost);
                    Err(BrokerError::ConnectionFailed(
                        "connection reset during publish".to_string(),
                    ))
                }
                Some(PublishFault::ExchangeNotFound) => {
                    let reason = format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange);
                    Err(state.fail_channel(self.id, NOT_FOUND, reason))
                }
                Some(PublishFault::ChannelClosed { code, reason }) => {
                    Err(state.fail_channel(self.id, code, reason))
                }
                None => publish_locked(
                    &mut state,
                    self.id,
                    exchange,
                    routing_key,
                    properties,
                    body,
                    mandatory,
                ),
            }
        };

        self.shared.notify.notify_waiters();
        result
    }

    async fn basic_consume(&mut self, queue: &str, _auto_ack: bool) -> BrokerResult<String> {
        let mut state = self.shared.state.lock();
        state.check_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{}'", queue);
            return Err(state.fail_channel(self.id, NOT_FOUND, reason));
        }
        if state.locked_by_other(queue, self.connection) {
            let reason = format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                queue
            );
            return Err(state.fail_channel(self.id, RESOURCE_LOCKED, reason));
        }

        let tag = format!("ctag-{}", uuid::Uuid::new_v4().simple());
        state.consumers.insert(
            tag.clone(),
            ConsumerSlot {
                queue: queue.to_string(),
                channel: self.id,
                connection: self.connection,
            },
        );
        if let Some(declared) = state.queues.get_mut(queue) {
            declared.had_consumer = true;
        }
        Ok(tag)
    }

    async fn next_delivery(&mut self) -> BrokerResult<Delivery> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_next() {
                return result;
            }

            notified.await;
        }
    }

    async fn close(&mut self) -> BrokerResult<()> {
        let id = self.id;
        self.shared.update(|state| state.close_channel(id));
        Ok(())
    }
}

fn publish_locked(
    state: &mut State,
    channel: u64,
    exchange: &str,
    routing_key: &str,
    properties: &Properties,
    body: &[u8],
    mandatory: bool,
) -> BrokerResult<()> {
    if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
        let reason = format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange);
        return Err(state.fail_channel(channel, NOT_FOUND, reason));
    }

    let targets = state.route(exchange, routing_key);
    for queue in &targets {
        state.next_seq += 1;
        let seq = state.next_seq;
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.messages.push_back(QueuedMessage {
                seq,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
            });
        }
    }

    let routed = !targets.is_empty();
    state.journal.push(PublishedMessage {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        properties: properties.clone(),
        body: body.to_vec(),
        mandatory,
        routed_to: targets,
    });

    if !routed && mandatory {
        return Err(BrokerError::Unroutable {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
    }
    Ok(())
}
