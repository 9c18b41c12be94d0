//! Publisher and subscriber behind one object.

use std::sync::Arc;

use serde::Serialize;
use topiq_broker::{Connector, TopicPattern};

use crate::config::Config;
use crate::error::Result;
use crate::listener::{EventListener, HandlerResult};
use crate::publisher::{EmitOptions, Publisher};
use crate::registry::{BindOptions, HandlerId};
use crate::subscriber::Subscriber;

/// A [`Publisher`] and a [`Subscriber`] built from the same configuration,
/// each with its own connection.
///
/// `consume` occupies the object; use [`PubSub::into_parts`] to run the
/// subscriber on its own task while publishing.
#[derive(Debug)]
pub struct PubSub {
    publisher: Publisher,
    subscriber: Subscriber,
}

impl PubSub {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        Ok(Self {
            publisher: Publisher::new(config.clone(), Arc::clone(&connector))?,
            subscriber: Subscriber::new(config, connector)?,
        })
    }

    pub fn publisher(&mut self) -> &mut Publisher {
        &mut self.publisher
    }

    pub fn subscriber(&mut self) -> &mut Subscriber {
        &mut self.subscriber
    }

    pub fn into_parts(self) -> (Publisher, Subscriber) {
        (self.publisher, self.subscriber)
    }

    pub async fn emit<T>(&mut self, event: &str, payload: &T, options: EmitOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.emit(event, payload, options).await
    }

    pub fn bind<P, L>(&mut self, patterns: P, options: BindOptions, listener: L) -> Result<HandlerId>
    where
        P: IntoIterator,
        P::Item: Into<TopicPattern>,
        L: EventListener + 'static,
    {
        self.subscriber.bind(patterns, options, listener)
    }

    pub fn bind_fn<P, F>(&mut self, patterns: P, options: BindOptions, f: F) -> Result<HandlerId>
    where
        P: IntoIterator,
        P::Item: Into<TopicPattern>,
        F: Fn(&str, &serde_json::Value, &topiq_broker::Properties) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.subscriber.bind_fn(patterns, options, f)
    }

    pub async fn consume(&mut self) -> Result<()> {
        self.subscriber.consume().await
    }

    /// Close both connections.
    pub async fn close(&mut self) {
        self.publisher.close().await;
        self.subscriber.close().await;
    }
}
