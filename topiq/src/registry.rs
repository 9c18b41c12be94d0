//! Event binding registry
//!
//! Bindings are collected during setup, grouped by the (exchange, queue) pair
//! they consume from. Insertion order is kept both across keys and within a
//! key, since it decides the order a switch runs overlapping handlers in.
//! Once a subscriber starts consuming the registry is frozen and turned into
//! one [`QueuePlan`] per key.

use std::fmt;
use std::sync::Arc;

use topiq_broker::{QueueOptions, TopicPattern};

use crate::dispatch::{MessageHandler, QueueDispatcher};
use crate::error::{Error, Result};
use crate::serializer::Serializer;

/// Unique identifier for a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// The (exchange, queue) pair a binding consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub exchange: String,
    /// Empty for an anonymous queue named by the broker
    pub queue: String,
}

impl BindingKey {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = if self.queue.is_empty() {
            "<anonymous>"
        } else {
            &self.queue
        };
        write!(f, "{}/{}", self.exchange, queue)
    }
}

/// Where and how a handler is bound. Unset fields take the subscriber's
/// defaults; empty names count as unset.
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub exclusive: Option<bool>,
    pub serializer: Option<Arc<dyn Serializer>>,
}

impl BindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }
}

/// One registered handler and the patterns it listens to.
#[derive(Clone)]
pub struct EventBinding {
    id: HandlerId,
    patterns: Vec<TopicPattern>,
    exclusive: bool,
    handler: MessageHandler,
}

impl EventBinding {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn patterns(&self) -> &[TopicPattern] {
        &self.patterns
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn handler(&self) -> &MessageHandler {
        &self.handler
    }

    /// True when any of the binding's patterns matches `event`.
    pub fn matches(&self, event: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(event))
    }
}

impl fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patterns: Vec<&str> = self.patterns.iter().map(TopicPattern::as_str).collect();
        f.debug_struct("EventBinding")
            .field("id", &self.id)
            .field("patterns", &patterns)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// Queue flags for a key: exclusive when the queue is anonymous or any of
/// its bindings asked for exclusivity.
pub fn queue_options(queue: &str, any_exclusive: bool) -> QueueOptions {
    if queue.is_empty() || any_exclusive {
        QueueOptions::exclusive()
    } else {
        QueueOptions::durable()
    }
}

/// Topology and dispatcher for one (exchange, queue) key.
#[derive(Debug, Clone)]
pub struct QueuePlan {
    pub key: BindingKey,
    pub options: QueueOptions,
    /// Every distinct pattern across the key's bindings, in binding order
    pub routing_keys: Vec<String>,
    pub dispatcher: Arc<QueueDispatcher>,
}

/// Ordered map from [`BindingKey`] to the bindings registered on it.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    entries: Vec<(BindingKey, Vec<EventBinding>)>,
    next_id: u64,
    frozen: bool,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding under `key`.
    pub fn insert(
        &mut self,
        key: BindingKey,
        patterns: Vec<TopicPattern>,
        exclusive: bool,
        handler: MessageHandler,
    ) -> Result<HandlerId> {
        if self.frozen {
            return Err(Error::BindingsFrozen);
        }
        if patterns.is_empty() {
            return Err(Error::InvalidBinding(format!(
                "no event patterns given for {}",
                key
            )));
        }

        self.next_id += 1;
        let id = HandlerId(self.next_id);
        let binding = EventBinding {
            id,
            patterns,
            exclusive,
            handler,
        };

        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, bindings)) => bindings.push(binding),
            None => self.entries.push((key, vec![binding])),
        }

        Ok(id)
    }

    /// Number of distinct (exchange, queue) keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &BindingKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn bindings(&self, key: &BindingKey) -> Option<&[EventBinding]> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, bindings)| bindings.as_slice())
    }

    /// Reject further bindings.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Derive topology and dispatch for every key, in insertion order.
    pub fn plan(&self) -> Vec<QueuePlan> {
        self.entries
            .iter()
            .filter_map(|(key, bindings)| {
                let any_exclusive = bindings.iter().any(EventBinding::is_exclusive);

                let mut routing_keys: Vec<String> = Vec::new();
                for pattern in bindings.iter().flat_map(EventBinding::patterns) {
                    if !routing_keys.iter().any(|k| k == pattern.as_str()) {
                        routing_keys.push(pattern.as_str().to_string());
                    }
                }

                let dispatcher = QueueDispatcher::for_bindings(bindings.clone())?;
                Some(QueuePlan {
                    key: key.clone(),
                    options: queue_options(&key.queue, any_exclusive),
                    routing_keys,
                    dispatcher: Arc::new(dispatcher),
                })
            })
            .collect()
    }
}
