//! Event Broker (§4.9): one broadcast channel delivering a stable,
//! ordered stream of lifecycle events to every connected client.
//!
//! A `tokio::sync::broadcast` channel wrapped so each subscriber gets
//! its own receiver and lag is visible rather than silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Closed set of event types the daemon ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TasksUpdated,
    AgentStarted,
    AgentOutput,
    AgentCompleted,
    AgentFailed,
    AgentQuestion,
    StateSnapshot,
    Heartbeat,
    WorkflowStarted,
    WorkflowStepStarted,
    WorkflowStepCompleted,
    WorkflowBlocked,
    WorkflowMergePending,
    WorkflowCompleted,
    WorkflowCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TasksUpdated => "tasks.updated",
            EventType::AgentStarted => "agent.started",
            EventType::AgentOutput => "agent.output",
            EventType::AgentCompleted => "agent.completed",
            EventType::AgentFailed => "agent.failed",
            EventType::AgentQuestion => "agent.question",
            EventType::StateSnapshot => "state.snapshot",
            EventType::Heartbeat => "heartbeat",
            EventType::WorkflowStarted => "workflow.started",
            EventType::WorkflowStepStarted => "workflow.step.started",
            EventType::WorkflowStepCompleted => "workflow.step.completed",
            EventType::WorkflowBlocked => "workflow.blocked",
            EventType::WorkflowMergePending => "workflow.merge_pending",
            EventType::WorkflowCompleted => "workflow.completed",
            EventType::WorkflowCancelled => "workflow.cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Per-subscriber queue depth. Past this bound the broadcast channel
/// drops the oldest unread event for that subscriber rather than
/// blocking the publisher (§4.9, §5 "Suspension points" (e)).
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct EventBroker {
    sender: broadcast::Sender<Event>,
}

impl EventBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_QUEUE_DEPTH);
        Self { sender }
    }

    pub fn publish(&self, event_type: EventType, data: serde_json::Value) {
        let event = Event::new(event_type, data);
        // A `send` error just means there are currently no subscribers;
        // the event is not retained for late joiners, which is correct —
        // new subscribers get a fresh `state.snapshot` instead.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let broker = EventBroker::new();
        let mut rx = broker.subscribe();

        broker.publish(EventType::WorkflowStarted, serde_json::json!({"id": "T1"}));
        broker.publish(EventType::WorkflowCompleted, serde_json::json!({"id": "T1"}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type.as_str(), "workflow.started");
        assert_eq!(second.event_type.as_str(), "workflow.completed");
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let broker = EventBroker::new();
        broker.publish(EventType::Heartbeat, serde_json::json!({}));

        let mut rx = broker.subscribe();
        broker.publish(EventType::WorkflowStarted, serde_json::json!({"id": "T2"}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type.as_str(), "workflow.started");
    }
}
