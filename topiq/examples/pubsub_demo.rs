//! Publish/subscribe walkthrough against the in-process broker
//!
//! Shows overlapping bindings dispatched through a switch, an anonymous
//! per-process queue, handler isolation, and a consumer that recovers
//! from a dropped connection.
//!
//! Run with `RUST_LOG=topiq=debug cargo run --example pubsub_demo` to see
//! the connection and dispatch logs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use topiq::prelude::*;
use topiq::{Jitter, RetryPolicy};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct OrderCreated {
    id: u64,
    customer: String,
    total_cents: u64,
}

/// Listener that keeps a running count of what it has seen.
struct Auditor {
    seen: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl EventListener for Auditor {
    async fn on_event(&self, event: &str, payload: &Value, props: &Properties) -> HandlerResult {
        let n = self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        println!(
            "   🔎 audit #{} {} from {} ({} bytes of JSON)",
            n,
            event,
            props.app_id.as_deref().unwrap_or("unknown"),
            payload.to_string().len()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("topiq=info")),
        )
        .init();

    println!("📬 topiq - publish/subscribe demo");
    println!("=================================");

    let broker = MemoryBroker::new();
    let config = Config::new()
        .with_url("memory://demo")
        .with_app_id("shop-service")
        .with_exchange("shop")
        .with_connect_retry(RetryPolicy::forever(
            Duration::from_millis(200),
            Jitter::range(Duration::ZERO, Duration::from_millis(100)),
        ));

    let mut subscriber = Subscriber::new(config.clone(), Arc::new(broker.clone()))?;
    let orders = BindOptions::new().queue("orders");

    subscriber.bind_fn(["order.created"], orders.clone(), |_event, payload, _props| {
        println!("   📦 fulfilment picked up order {}", payload["id"]);
        Ok(())
    })?;
    subscriber.bind_fn(["order.*"], orders.clone(), |event, _payload, _props| {
        println!("   📈 analytics counted {}", event);
        Ok(())
    })?;
    subscriber.bind_fn(["order.cancelled"], orders, |_event, _payload, _props| {
        Err("refund service unavailable".into())
    })?;
    subscriber.bind(
        ["#"],
        BindOptions::new(),
        Auditor {
            seen: Default::default(),
        },
    )?;

    println!("\n🚀 Starting consumer with {} bindings", subscriber.registry().len());
    let consumer = subscriber.spawn();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut publisher = Publisher::new(config, Arc::new(broker.clone()))?;

    println!("\n📤 order.created");
    publisher
        .emit(
            "order.created",
            &OrderCreated {
                id: 1001,
                customer: "ada".to_string(),
                total_cents: 4200,
            },
            EmitOptions::new().correlation_id("checkout-1"),
        )
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n📤 order.cancelled (one handler fails, the others still run)");
    publisher
        .emit("order.cancelled", &serde_json::json!({"id": 1001}), EmitOptions::new())
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n⚡ Dropping every broker connection");
    broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(500)).await;

    println!("\n📤 user.signed_up (after reconnect)");
    publisher
        .emit("user.signed_up", &serde_json::json!({"user": "grace"}), EmitOptions::new())
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n📤 mandatory publish nobody listens for");
    match publisher
        .emit("audit.none", &(), EmitOptions::new().exchange("empty").mandatory(true))
        .await
    {
        Err(Error::Unroutable { exchange, routing_key }) => {
            println!("   ↩️  returned: {} on {}", routing_key, exchange)
        }
        other => println!("   unexpected result: {:?}", other),
    }

    println!("\n🛑 Shutting down");
    consumer.shutdown().await?;
    publisher.close().await;

    println!("✅ Done. Queues left on the broker: {:?}", broker.queue_names());
    Ok(())
}
