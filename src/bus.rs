//! Event bus seam: lifecycle events fan out to external transports.
//!
//! The core only needs publish/subscribe with at-least-once local
//! delivery; Kafka/NATS transports implement the same trait out of tree.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Topic for execution-level lifecycle events.
pub const EXECUTION_TOPIC: &str = "workflow.execution.events";
/// Topic for node-level lifecycle events.
pub const NODE_TOPIC: &str = "workflow.node.events";
/// Topic for state-machine lifecycle events.
pub const STATE_MACHINE_TOPIC: &str = "workflow.statemachine.events";

/// An event on the bus.
#[derive(Clone, Debug)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

pub type BusHandler = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub trait EventBus: Send + Sync {
    fn publish<'a>(&'a self, topic: &'a str, payload: Value) -> BoxFuture<'a, ()>;

    fn subscribe<'a>(&'a self, topic: &'a str, handler: BusHandler) -> BoxFuture<'a, ()>;
}

/// In-process bus: handlers run inline on publish. Handler panics are
/// isolated per delivery by the spawned task boundary.
#[derive(Default)]
pub struct MemoryEventBus {
    subscribers: Mutex<HashMap<String, Vec<BusHandler>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for MemoryEventBus {
    fn publish<'a>(&'a self, topic: &'a str, payload: Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let handlers = {
                let subscribers = self.subscribers.lock().await;
                subscribers.get(topic).cloned().unwrap_or_default()
            };
            if handlers.is_empty() {
                return;
            }
            debug!(topic, subscribers = handlers.len(), "publishing event");
            let event = BusEvent {
                topic: topic.to_string(),
                payload,
                ts: Utc::now(),
            };
            let mut deliveries = Vec::with_capacity(handlers.len());
            for handler in handlers {
                let event = event.clone();
                deliveries.push(tokio::spawn(async move { handler(event).await }));
            }
            for delivery in deliveries {
                if delivery.await.is_err() {
                    warn!(topic, "event subscriber panicked");
                }
            }
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str, handler: BusHandler) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.entry(topic.to_string()).or_default().push(handler);
        })
    }
}
