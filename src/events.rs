//! Lifecycle event emitter.
//!
//! Assigns a monotonic `event_seq` per execution, persists the event, then
//! publishes to the bus. Persistence happens before publication so every
//! externally observable event is already durable; consumers deduplicate
//! redeliveries on `(execution_id, event_seq)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{EXECUTION_TOPIC, EventBus, NODE_TOPIC};
use crate::model::{EventKind, ExecutionEvent};
use crate::storage::ExecutionRepo;

#[derive(Clone)]
pub struct EventEmitter {
    bus: Arc<dyn EventBus>,
    repo: Arc<dyn ExecutionRepo>,
    sequences: Arc<Mutex<HashMap<Uuid, u64>>>,
}

impl EventEmitter {
    pub fn new(bus: Arc<dyn EventBus>, repo: Arc<dyn ExecutionRepo>) -> Self {
        Self {
            bus,
            repo,
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_seq(&self, execution_id: Uuid) -> u64 {
        let mut sequences = self.sequences.lock().expect("event seq lock");
        let seq = sequences.entry(execution_id).or_insert(0);
        *seq += 1;
        *seq
    }

    pub async fn emit(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
        kind: EventKind,
        payload: Value,
    ) {
        let event = ExecutionEvent {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.map(str::to_string),
            event_type: kind,
            event_seq: self.next_seq(execution_id),
            payload,
            ts: Utc::now(),
        };
        if let Err(err) = self.repo.append_event(&event).await {
            warn!(
                execution_id = %execution_id,
                event = kind.as_str(),
                error = %err,
                "failed to persist event"
            );
        }
        let topic = if kind.is_node_event() {
            NODE_TOPIC
        } else {
            EXECUTION_TOPIC
        };
        let body = json!({
            "event": kind.as_str(),
            "execution_id": execution_id,
            "node_id": event.node_id,
            "event_seq": event.event_seq,
            "payload": event.payload,
            "ts": event.ts,
        });
        self.bus.publish(topic, body).await;
    }

    pub async fn emit_execution(&self, execution_id: Uuid, kind: EventKind) {
        self.emit(execution_id, None, kind, Value::Null).await;
    }

    pub async fn emit_node(&self, execution_id: Uuid, node_id: &str, kind: EventKind) {
        self.emit(execution_id, Some(node_id), kind, Value::Null).await;
    }
}
