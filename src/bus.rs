//! Publish/subscribe for UI-facing notifications
//!
//! The bus is an owned value handed to whoever needs it, one per runtime.
//! Publishing never blocks and never fails: with no subscribers the event
//! is simply dropped.

use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub const FILE_TREE_REFRESH: &str = "file-tree:refresh";
pub const EDITOR_FILE_CHANGED: &str = "editor:file-changed";
pub const ROLLBACK_COMPLETED: &str = "snapshot:rollback-completed";
pub const SESSION_UPDATED: &str = "session:updated";
pub const ACTIVE_SESSION_CHANGED: &str = "session:active-changed";

/// Notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    FileTreeRefresh,
    EditorFileChanged {
        file_path: String,
    },
    RollbackCompleted {
        session_id: String,
        turn_index: usize,
        restored_files: Vec<String>,
    },
    SessionUpdated {
        session_id: String,
    },
    ActiveSessionChanged {
        session_id: Option<String>,
    },
}

impl CoreEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::FileTreeRefresh => FILE_TREE_REFRESH,
            CoreEvent::EditorFileChanged { .. } => EDITOR_FILE_CHANGED,
            CoreEvent::RollbackCompleted { .. } => ROLLBACK_COMPLETED,
            CoreEvent::SessionUpdated { .. } => SESSION_UPDATED,
            CoreEvent::ActiveSessionChanged { .. } => ACTIVE_SESSION_CHANGED,
        }
    }

    /// Event payload with camelCase keys
    pub fn payload(&self) -> Value {
        match self {
            CoreEvent::FileTreeRefresh => Value::Null,
            CoreEvent::EditorFileChanged { file_path } => json!({ "filePath": file_path }),
            CoreEvent::RollbackCompleted {
                session_id,
                turn_index,
                restored_files,
            } => json!({
                "sessionId": session_id,
                "turnIndex": turn_index,
                "restoredFiles": restored_files,
            }),
            CoreEvent::SessionUpdated { session_id } => json!({ "sessionId": session_id }),
            CoreEvent::ActiveSessionChanged { session_id } => json!({ "sessionId": session_id }),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "event": self.name(), "payload": self.payload() })
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        tracing::debug!(event = event.name(), "Publishing core event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream. A subscriber that falls behind skips the
    /// events it missed instead of ending the stream.
    pub fn stream(&self) -> impl Stream<Item = CoreEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Bus subscriber lagged, events dropped");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
