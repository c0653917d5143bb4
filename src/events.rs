//! The optional domain event sink (§6, §9): `ExecutionStarted`,
//! `StepCompleted`, `ExecutionCompleted`, `DecisionMade` are pushed onto a
//! bounded channel and drained by handlers outside the engine's
//! transaction. Delivery is best-effort — a full channel or a closed
//! receiver never fails the engine operation that produced the event.

use crate::value::ValueMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventType {
    ExecutionStarted,
    StepCompleted,
    ExecutionCompleted,
    DecisionMade,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: DomainEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: ValueMap,
}

impl DomainEvent {
    pub fn new(event_type: DomainEventType, payload: ValueMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Publishing side of the event bus, cloned into the engine. Constructed
/// once at startup alongside the inventory-oracle client (§9: both are
/// per-process singletons passed explicitly, never hidden module-scoped
/// state).
#[derive(Clone)]
pub struct EventBus {
    sender: tokio::sync::mpsc::Sender<DomainEvent>,
}

impl EventBus {
    /// Creates the bus and returns both halves; the receiver is handed to
    /// whatever task runs the registered `EventSink` handlers.
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<DomainEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Non-blocking publish from synchronous engine code. A full channel or
    /// a dropped receiver is logged and otherwise ignored — event delivery
    /// never aborts the engine operation that produced it.
    pub fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.sender.try_send(event) {
            log::warn!("event sink delivery dropped: {}", e);
        }
    }
}

/// A consumer of dispatched `DomainEvent`s. Implementations must be
/// idempotent: delivery is at-least-once and there is no ordering guarantee
/// across executions (§5).
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: DomainEvent);
}

/// Drains `receiver`, forwarding every event to `sink`. Run as a background
/// task outside any engine transaction.
pub async fn run_event_loop(mut receiver: tokio::sync::mpsc::Receiver<DomainEvent>, sink: std::sync::Arc<dyn EventSink>) {
    while let Some(event) = receiver.recv().await {
        sink.handle(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_does_not_block_or_panic_on_a_full_channel() {
        let (bus, _receiver) = EventBus::new(1);
        bus.publish(DomainEvent::new(DomainEventType::ExecutionStarted, ValueMap::new()));
        // Second publish exceeds capacity 1 with no reader draining; must not panic.
        bus.publish(DomainEvent::new(DomainEventType::ExecutionStarted, ValueMap::new()));
    }

    #[tokio::test]
    async fn published_events_are_observed_in_order_by_a_single_consumer() {
        let (bus, mut receiver) = EventBus::new(8);
        bus.publish(DomainEvent::new(DomainEventType::ExecutionStarted, ValueMap::new()));
        bus.publish(DomainEvent::new(DomainEventType::StepCompleted, ValueMap::new()));

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(first.event_type, DomainEventType::ExecutionStarted);
        assert_eq!(second.event_type, DomainEventType::StepCompleted);
    }
}
