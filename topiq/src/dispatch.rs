//! Delivery dispatch.
//!
//! Every binding's listener is wrapped in a [`MessageHandler`] that decodes
//! the payload, calls the listener, and turns errors and panics into a logged
//! [`CallbackFailure`]. A queue with a single binding hands deliveries to that
//! handler directly; a queue shared by several bindings goes through a switch
//! that runs every binding whose patterns match the event name, in
//! registration order.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use topiq_broker::Delivery;

use crate::listener::EventListener;
use crate::registry::EventBinding;
use crate::serializer::{Serializer, SerializerError};

/// Why a handler invocation failed. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum CallbackFailure {
    /// The payload could not be decoded
    #[error("{0}")]
    Decode(#[from] SerializerError),

    /// The listener returned an error
    #[error("handler returned error: {0}")]
    Handler(String),

    /// The listener panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Event name of a delivery: the message type, or the routing key when the
/// producer did not set one.
pub fn event_name(delivery: &Delivery) -> &str {
    delivery
        .properties
        .kind
        .as_deref()
        .unwrap_or(&delivery.routing_key)
}

/// Identity of the publishing application, if known.
pub fn event_source(delivery: &Delivery) -> &str {
    delivery.properties.app_id.as_deref().unwrap_or("unknown")
}

/// A listener plus the serializer used to decode its payloads.
#[derive(Clone)]
pub struct MessageHandler {
    listener: Arc<dyn EventListener>,
    serializer: Arc<dyn Serializer>,
}

impl MessageHandler {
    pub fn new(listener: Arc<dyn EventListener>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            listener,
            serializer,
        }
    }

    /// Decode and deliver one message, containing any failure.
    pub async fn handle(&self, delivery: &Delivery) -> Result<(), CallbackFailure> {
        let event = event_name(delivery);
        let source = event_source(delivery);

        tracing::info!(
            "Received message type {} from source {} of length {}",
            event,
            source,
            delivery.body.len()
        );

        let result = self.invoke(event, delivery).await;
        if let Err(failure) = &result {
            tracing::error!(
                "Error in callback for message type {} from source {}: {}",
                event,
                source,
                failure
            );
        }
        result
    }

    async fn invoke(&self, event: &str, delivery: &Delivery) -> Result<(), CallbackFailure> {
        let payload = self.serializer.decode(&delivery.body)?;

        let call = self
            .listener
            .on_event(event, &payload, &delivery.properties);

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CallbackFailure::Handler(e.to_string())),
            Err(panic) => Err(CallbackFailure::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("serializer", &self.serializer)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// How a queue's deliveries reach its bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Direct,
    Switch,
}

/// Counts for one dispatched delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers called
    pub invoked: usize,
    /// Handlers that failed
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failed
    }
}

/// Handler installed for one queue.
#[derive(Debug)]
pub enum QueueDispatcher {
    /// The only binding on the queue
    Direct(EventBinding),
    /// Several bindings, selected per delivery by pattern
    Switch(Vec<EventBinding>),
}

impl QueueDispatcher {
    /// Choose direct or switch dispatch. `None` for an empty list.
    pub fn for_bindings(mut bindings: Vec<EventBinding>) -> Option<Self> {
        match bindings.len() {
            0 => None,
            1 => bindings.pop().map(QueueDispatcher::Direct),
            _ => Some(QueueDispatcher::Switch(bindings)),
        }
    }

    pub fn kind(&self) -> DispatchKind {
        match self {
            QueueDispatcher::Direct(_) => DispatchKind::Direct,
            QueueDispatcher::Switch(_) => DispatchKind::Switch,
        }
    }

    pub fn bindings(&self) -> &[EventBinding] {
        match self {
            QueueDispatcher::Direct(binding) => std::slice::from_ref(binding),
            QueueDispatcher::Switch(bindings) => bindings,
        }
    }

    /// Run the handlers for one delivery. Handlers run one after another and
    /// a failing handler does not stop the rest.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        match self {
            QueueDispatcher::Direct(binding) => {
                outcome.invoked = 1;
                if binding.handler().handle(delivery).await.is_err() {
                    outcome.failed = 1;
                }
            }
            QueueDispatcher::Switch(bindings) => {
                let event = event_name(delivery);
                for binding in bindings.iter().filter(|b| b.matches(event)) {
                    outcome.invoked += 1;
                    if binding.handler().handle(delivery).await.is_err() {
                        outcome.failed += 1;
                    }
                }
                if outcome.invoked == 0 {
                    tracing::debug!("No binding matched event {}", event);
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{FnListener, HandlerResult};
    use crate::registry::{BindingRegistry, BindingKey};
    use crate::serializer::JsonSerializer;
    use serde_json::Value;
    use topiq_broker::{Properties, TopicPattern};

    /// Collects `(tag, event)` pairs from handlers.
    #[derive(Clone, Default)]
    struct Recorder(Arc<std::sync::Mutex<Vec<(String, String)>>>);

    impl Recorder {
        fn push(&self, tag: &str, event: &str) {
            self.0.lock().unwrap().push((tag.to_string(), event.to_string()));
        }

        fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn delivery(event: &str, body: &[u8]) -> Delivery {
        Delivery {
            consumer_tag: "ctag".to_string(),
            delivery_tag: 1,
            exchange: "events".to_string(),
            routing_key: event.to_string(),
            redelivered: false,
            properties: Properties::default().with_kind(event).with_app_id("tests"),
            body: body.to_vec(),
        }
    }

    fn recording(recorder: &Recorder, tag: &'static str) -> MessageHandler {
        let recorder = recorder.clone();
        let listener = FnListener::new(move |event: &str, _: &Value, _: &Properties| -> HandlerResult {
            recorder.push(tag, event);
            Ok(())
        });
        MessageHandler::new(Arc::new(listener), Arc::new(JsonSerializer))
    }

    fn failing() -> MessageHandler {
        let listener = FnListener::new(|_: &str, _: &Value, _: &Properties| -> HandlerResult {
            Err("boom".into())
        });
        MessageHandler::new(Arc::new(listener), Arc::new(JsonSerializer))
    }

    fn panicking() -> MessageHandler {
        let listener = FnListener::new(|_: &str, _: &Value, _: &Properties| -> HandlerResult {
            panic!("handler exploded")
        });
        MessageHandler::new(Arc::new(listener), Arc::new(JsonSerializer))
    }

    fn dispatcher(entries: Vec<(&str, MessageHandler)>) -> QueueDispatcher {
        let key = BindingKey::new("events", "q");
        let mut registry = BindingRegistry::new();
        for (pattern, handler) in entries {
            registry
                .insert(key.clone(), vec![TopicPattern::new(pattern)], false, handler)
                .unwrap();
        }
        let mut plans = registry.plan();
        let plan = plans.remove(0);
        Arc::try_unwrap(plan.dispatcher).unwrap()
    }

    #[test]
    fn test_event_name_falls_back_to_routing_key() {
        let mut message = delivery("order.created", b"{}");
        assert_eq!(event_name(&message), "order.created");
        message.properties.kind = None;
        message.routing_key = "order.updated".to_string();
        assert_eq!(event_name(&message), "order.updated");
        message.properties.app_id = None;
        assert_eq!(event_source(&message), "unknown");
    }

    #[tokio::test]
    async fn test_handler_decodes_payload() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        let listener = FnListener::new(move |_: &str, payload: &Value, _: &Properties| -> HandlerResult {
            *sink.lock().unwrap() = Some(payload.clone());
            Ok(())
        });
        let handler = MessageHandler::new(Arc::new(listener), Arc::new(JsonSerializer));

        handler
            .handle(&delivery("order.created", br#"{"id":3}"#))
            .await
            .unwrap();
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(serde_json::json!({"id": 3}))
        );
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let result = failing().handle(&delivery("a", b"{}")).await;
        assert!(matches!(result, Err(CallbackFailure::Handler(m)) if m == "boom"));

        let result = panicking().handle(&delivery("a", b"{}")).await;
        assert!(matches!(result, Err(CallbackFailure::Panicked(m)) if m == "handler exploded"));

        let result = failing().handle(&delivery("a", b"not json")).await;
        assert!(matches!(result, Err(CallbackFailure::Decode(_))));
    }

    #[tokio::test]
    async fn test_single_binding_is_direct() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(vec![("order.*", recording(&recorder, "only"))]);
        assert_eq!(dispatcher.kind(), DispatchKind::Direct);

        let outcome = dispatcher.dispatch(&delivery("order.created", b"{}")).await;
        assert_eq!(outcome, DispatchOutcome { invoked: 1, failed: 0 });
        assert_eq!(recorder.take(), vec![("only".into(), "order.created".into())]);
    }

    #[tokio::test]
    async fn test_switch_runs_every_match_in_order() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(vec![
            ("order.#", recording(&recorder, "all-orders")),
            ("invoice.*", recording(&recorder, "invoices")),
            ("order.created", recording(&recorder, "created")),
        ]);
        assert_eq!(dispatcher.kind(), DispatchKind::Switch);

        let outcome = dispatcher.dispatch(&delivery("order.created", b"{}")).await;
        assert_eq!(outcome.invoked, 2);
        assert_eq!(
            recorder.take(),
            vec![
                ("all-orders".into(), "order.created".into()),
                ("created".into(), "order.created".into()),
            ]
        );

        let outcome = dispatcher.dispatch(&delivery("shipment.sent", b"{}")).await;
        assert_eq!(outcome.invoked, 0);
    }

    #[tokio::test]
    async fn test_switch_isolates_failures() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(vec![
            ("order.created", failing()),
            ("order.created", panicking()),
            ("order.created", recording(&recorder, "survivor")),
        ]);

        let outcome = dispatcher.dispatch(&delivery("order.created", b"{}")).await;
        assert_eq!(outcome, DispatchOutcome { invoked: 3, failed: 2 });
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(recorder.take().len(), 1);
    }
}
