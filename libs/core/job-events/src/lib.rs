//! Structured status events for note/import progress, persisted and broadcast
//! to live subscribers (the HTTP/WS layer that renders progress is out of
//! scope here; this crate only owns the append-only log and the channel).

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Lifecycle status carried by a [`StatusEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
    AwaitingParsing,
}

/// A single structured progress update for an import (optionally scoped to
/// one note within it).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusEvent {
    pub import_id: String,
    pub note_id: Option<String>,
    pub status: JobStatus,
    pub message: String,
    pub context: String,
    pub indent_level: Option<u8>,
    pub metadata: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(
        import_id: impl Into<String>,
        status: JobStatus,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            import_id: import_id.into(),
            note_id: None,
            status,
            message: message.into(),
            context: context.into(),
            indent_level: None,
            metadata: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_note_id(mut self, note_id: impl Into<String>) -> Self {
        self.note_id = Some(note_id.into());
        self
    }

    pub fn with_indent_level(mut self, indent_level: u8) -> Self {
        self.indent_level = Some(indent_level);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Serialize) -> Self {
        self.metadata = serde_json::to_value(metadata).ok();
        self
    }
}

/// Error raised when a status event cannot be recorded. Call sites decide
/// whether to swallow this (the `BaseAction` envelope does) or propagate it.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("status event channel is closed")]
    ChannelClosed,
}

/// Appends events to an `importId`-keyed in-memory log and fans them out on
/// a broadcast channel for live subscribers.
pub struct StatusBroadcaster {
    log: RwLock<HashMap<String, Vec<StatusEvent>>>,
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            log: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Persists `event` to the per-import log and publishes it to subscribers.
    ///
    /// Persistence never fails. Publishing can only "fail" once every
    /// receiver has been dropped, which is a normal steady state (nobody is
    /// currently watching), not a pipeline error — so the caller still gets
    /// the persisted event back either way.
    pub fn add_status_event_and_broadcast(
        &self,
        event: StatusEvent,
    ) -> Result<StatusEvent, BroadcastError> {
        {
            let mut log = self.log.write().expect("status log lock poisoned");
            log.entry(event.import_id.clone())
                .or_default()
                .push(event.clone());
        }

        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// All events recorded for `import_id`, in emission order.
    pub fn events_for_import(&self, import_id: &str) -> Vec<StatusEvent> {
        self.log
            .read()
            .expect("status log lock poisoned")
            .get(import_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe to live events across all imports.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_events_per_import() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster
            .add_status_event_and_broadcast(StatusEvent::new(
                "import-1",
                JobStatus::Processing,
                "starting",
                "note_parsing",
            ))
            .unwrap();
        broadcaster
            .add_status_event_and_broadcast(StatusEvent::new(
                "import-1",
                JobStatus::Completed,
                "done",
                "note_parsing",
            ))
            .unwrap();
        broadcaster
            .add_status_event_and_broadcast(StatusEvent::new(
                "import-2",
                JobStatus::Processing,
                "starting",
                "note_parsing",
            ))
            .unwrap();

        let events = broadcaster.events_for_import("import-1");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, JobStatus::Processing);
        assert_eq!(events[1].status, JobStatus::Completed);
        assert_eq!(broadcaster.events_for_import("import-2").len(), 1);
        assert!(broadcaster.events_for_import("missing").is_empty());
    }

    #[tokio::test]
    async fn broadcasts_to_subscribers() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster
            .add_status_event_and_broadcast(
                StatusEvent::new("import-1", JobStatus::Processing, "starting", "ctx")
                    .with_note_id("note-1")
                    .with_indent_level(1),
            )
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.import_id, "import-1");
        assert_eq!(received.note_id.as_deref(), Some("note-1"));
        assert_eq!(received.indent_level, Some(1));
    }

    #[test]
    fn builder_sets_metadata() {
        let event = StatusEvent::new("import-1", JobStatus::Failed, "boom", "ctx")
            .with_metadata(serde_json::json!({"reason": "timeout"}));
        assert_eq!(
            event.metadata.unwrap()["reason"],
            serde_json::json!("timeout")
        );
    }
}
