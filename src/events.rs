use crate::constants::EVENT_CHANNEL_CAPACITY;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle event kinds published by a builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuilderEventKind {
    BuildTimeStarted,
    Begin,
    Done,
    Canceled,
    BuildTaskAddedInQueue,
    BuildTaskQueueTimeExceeded,
    MessageLogged,
}

/// A single numbered build log line carried by a `MessageLogged` event.
///
/// Line numbers exist because delivery to remote subscribers does not
/// preserve order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub line_number: u64,
    pub text: String,
}

/// Immutable lifecycle event; published once, never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderEvent {
    #[serde(rename = "type")]
    pub kind: BuilderEventKind,
    pub task_id: u64,
    pub workspace: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<LogMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reused: Option<bool>,
}

impl BuilderEvent {
    pub fn new(kind: BuilderEventKind, task_id: u64, workspace: &str, project: &str) -> Self {
        Self {
            kind,
            task_id,
            workspace: workspace.to_string(),
            project: project.to_string(),
            message: None,
            reused: None,
        }
    }

    pub fn with_message(mut self, line_number: u64, text: &str) -> Self {
        self.message = Some(LogMessage {
            line_number,
            text: text.to_string(),
        });
        self
    }

    pub fn with_reused(mut self, reused: bool) -> Self {
        self.reused = Some(reused);
        self
    }
}

/// In-process pub/sub bus standing in for the external event collaborator.
///
/// Publishing never blocks and never fails; events are dropped when no
/// subscriber is attached.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BuilderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuilderEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BuilderEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&BuilderEventKind::BuildTaskAddedInQueue).unwrap();
        assert_eq!(json, "\"BUILD_TASK_ADDED_IN_QUEUE\"");

        let json = serde_json::to_string(&BuilderEventKind::MessageLogged).unwrap();
        assert_eq!(json, "\"MESSAGE_LOGGED\"");
    }

    #[test]
    fn test_event_serialization_skips_empty_fields() {
        let event = BuilderEvent::new(BuilderEventKind::Begin, 7, "ws", "proj");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"BEGIN\""));
        assert!(!json.contains("message"));
        assert!(!json.contains("reused"));
    }

    #[test]
    fn test_event_message_roundtrip() {
        let event = BuilderEvent::new(BuilderEventKind::MessageLogged, 3, "ws", "proj")
            .with_message(12, "compiling module core");
        let json = serde_json::to_string(&event).unwrap();
        let back: BuilderEvent = serde_json::from_str(&json).unwrap();
        let msg = back.message.unwrap();
        assert_eq!(msg.line_number, 12);
        assert_eq!(msg.text, "compiling module core");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(BuilderEvent::new(BuilderEventKind::Done, 1, "ws", "p"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, BuilderEventKind::Done);
        assert_eq!(event.task_id, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(BuilderEvent::new(BuilderEventKind::Begin, 1, "ws", "p"));
    }
}
