//! Trait abstractions for external collaborators
//!
//! Everything the core does not own sits behind one of these traits so the
//! runtime can be driven by mocks in tests and by the replay tool.

use crate::dispatcher::OutgoingMessage;
use crate::flow::SessionConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a collaborator
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    /// The operation stopped partway; `completed` lists what was done
    #[error("Partially applied: {message}")]
    Partial {
        message: String,
        completed: Vec<String>,
    },
}

/// Snapshot record kept by the snapshot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub session_id: String,
    pub turn_index: usize,
    pub modified_files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Decoded image bytes ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    /// Id of the context item the image came from
    pub context_id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub context_id: String,
    pub image_id: String,
}

/// Creates backend sessions
#[async_trait]
pub trait SessionBootstrap: Send + Sync {
    async fn create_session(&self, config: &SessionConfig) -> Result<String, CollaboratorError>;

    /// Model configured for the workspace, if any
    async fn resolve_default_model(&self) -> Option<String>;
}

/// Uploads inline image payloads. All-or-nothing.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload_image_contexts(
        &self,
        session_id: &str,
        images: &[ImageUpload],
    ) -> Result<Vec<UploadedImage>, CollaboratorError>;
}

/// Sends prepared messages to the model backend
#[async_trait]
pub trait UpstreamSender: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), CollaboratorError>;
}

/// Turn-level workspace snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn create_snapshot(&self, session_id: &str, turn_index: usize) -> Result<(), CollaboratorError>;

    /// Restore the workspace to the state after `turn_index`, returning
    /// the restored file paths.
    async fn restore_to_turn(&self, session_id: &str, turn_index: usize) -> Result<Vec<String>, CollaboratorError>;

    async fn list_snapshots(&self, session_id: &str) -> Result<Vec<TurnSnapshot>, CollaboratorError>;
}

/// Control over the agent execution that produces the stream
#[async_trait]
pub trait AgentControl: Send + Sync {
    async fn resume_tool(
        &self,
        session_id: &str,
        turn_id: &str,
        tool_id: &str,
        input: &Value,
    ) -> Result<(), CollaboratorError>;

    async fn skip_tool(&self, session_id: &str, turn_id: &str, tool_id: &str) -> Result<(), CollaboratorError>;

    async fn cancel_turn(&self, session_id: &str, turn_id: &str) -> Result<(), CollaboratorError>;
}

/// The full set of collaborators a runtime talks to
#[derive(Clone)]
pub struct Collaborators {
    pub bootstrap: Arc<dyn SessionBootstrap>,
    pub uploader: Arc<dyn ImageUploader>,
    pub upstream: Arc<dyn UpstreamSender>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub agent: Arc<dyn AgentControl>,
}
