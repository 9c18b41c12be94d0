//! The handler side of a binding.

use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use topiq_broker::Properties;

/// What a handler returns. Errors are logged by the dispatcher and never
/// reach the consume loop.
pub type HandlerResult = std::result::Result<(), Box<dyn StdError + Send + Sync>>;

/// Receives events delivered to a binding.
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use topiq::{EventListener, HandlerResult, Properties};
///
/// struct AuditLog;
///
/// #[async_trait]
/// impl EventListener for AuditLog {
///     async fn on_event(&self, event: &str, payload: &Value, _props: &Properties) -> HandlerResult {
///         println!("{}: {}", event, payload);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &str, payload: &Value, props: &Properties) -> HandlerResult;
}

/// Adapts a plain closure into an [`EventListener`].
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&str, &Value, &Properties) -> HandlerResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> EventListener for FnListener<F>
where
    F: Fn(&str, &Value, &Properties) -> HandlerResult + Send + Sync,
{
    async fn on_event(&self, event: &str, payload: &Value, props: &Properties) -> HandlerResult {
        (self.f)(event, payload, props)
    }
}

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnListener")
    }
}
