//! Offline replay of recorded stream logs
//!
//! A log is JSON lines, one [`Inbound`] per line. Replaying feeds every
//! line through a runtime whose collaborators do nothing, then reports
//! the resulting session trees.

use crate::config::CoreConfig;
use crate::dispatcher::OutgoingMessage;
use crate::flow::{Session, SessionConfig};
use crate::runtime::{
    AgentControl, CollaboratorError, Collaborators, CoreRuntime, ImageUpload, ImageUploader, Inbound,
    SessionBootstrap, SnapshotStore, TurnSnapshot, UpstreamSender, UploadedImage,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read log: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid log entry on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Collaborators that accept everything and do nothing
pub struct NullCollaborators;

impl NullCollaborators {
    pub fn collaborators() -> Collaborators {
        let null = Arc::new(NullCollaborators);
        Collaborators {
            bootstrap: null.clone(),
            uploader: null.clone(),
            upstream: null.clone(),
            snapshots: null.clone(),
            agent: null,
        }
    }
}

#[async_trait]
impl SessionBootstrap for NullCollaborators {
    async fn create_session(&self, _config: &SessionConfig) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("no backend during replay".into()))
    }

    async fn resolve_default_model(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl ImageUploader for NullCollaborators {
    async fn upload_image_contexts(
        &self,
        _session_id: &str,
        _images: &[ImageUpload],
    ) -> Result<Vec<UploadedImage>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("no backend during replay".into()))
    }
}

#[async_trait]
impl UpstreamSender for NullCollaborators {
    async fn send(&self, _message: &OutgoingMessage) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for NullCollaborators {
    async fn create_snapshot(&self, _session_id: &str, _turn_index: usize) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn restore_to_turn(&self, _session_id: &str, _turn_index: usize) -> Result<Vec<String>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn list_snapshots(&self, _session_id: &str) -> Result<Vec<TurnSnapshot>, CollaboratorError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl AgentControl for NullCollaborators {
    async fn resume_tool(
        &self,
        _session_id: &str,
        _turn_id: &str,
        _tool_id: &str,
        _input: &Value,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn skip_tool(&self, _session_id: &str, _turn_id: &str, _tool_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn cancel_turn(&self, _session_id: &str, _turn_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Parse a JSON-lines log. Blank lines are skipped.
pub fn parse_log(contents: &str) -> Result<Vec<Inbound>, ReplayError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| ReplayError::Json {
                line: index + 1,
                source,
            })
        })
        .collect()
}

pub fn load_log(path: impl AsRef<Path>) -> Result<Vec<Inbound>, ReplayError> {
    let contents = std::fs::read_to_string(path)?;
    parse_log(&contents)
}

/// Feed `entries` through a fresh runtime and return every session.
pub async fn replay(entries: Vec<Inbound>, config: CoreConfig) -> Vec<Session> {
    let runtime = CoreRuntime::new(config, NullCollaborators::collaborators());
    let count = entries.len();
    for inbound in entries {
        runtime.handle(inbound).await;
    }
    let sessions = runtime.list_sessions().await;
    tracing::info!(entries = count, sessions = sessions.len(), "Replay finished");
    sessions
}
