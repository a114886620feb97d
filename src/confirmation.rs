//! Tool confirmation gate
//!
//! Tracks tools that need explicit user approval. The gate only owns its
//! own per-tool state; approving or rejecting yields a [`SessionEvent`] for
//! the session manager to apply.

use crate::state_machine::{ApplyError, SessionEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    PendingConfirmation,
    Confirmed,
    Running,
    Completed,
    Error,
    Rejected,
}

/// Where a gated tool lives in the conversation tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolLocation {
    pub session_id: String,
    pub turn_id: String,
    pub round_id: String,
}

/// A tool waiting for the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTool {
    pub tool_id: String,
    pub tool_name: String,
    pub input: Value,
    pub location: ToolLocation,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GateError {
    #[error("Tool {0} is not held at the confirmation gate")]
    UnknownTool(String),
    #[error("Tool {tool_id} was already resolved ({state:?})")]
    AlreadyResolved { tool_id: String, state: GateState },
}

/// Failure of a confirm/reject request as a whole
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfirmError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

#[derive(Debug, Clone)]
struct GateEntry {
    state: GateState,
    tool_name: String,
    input: Value,
    location: ToolLocation,
}

#[derive(Debug, Default)]
pub struct ConfirmationGate {
    entries: HashMap<String, GateEntry>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a tool until the user decides. Re-registering is a no-op.
    pub fn register(&mut self, tool_id: impl Into<String>, tool_name: impl Into<String>, input: Value, location: ToolLocation) {
        let tool_id = tool_id.into();
        if self.entries.contains_key(&tool_id) {
            return;
        }
        tracing::debug!(tool_id = %tool_id, turn_id = %location.turn_id, "Tool awaiting confirmation");
        self.entries.insert(
            tool_id,
            GateEntry {
                state: GateState::PendingConfirmation,
                tool_name: tool_name.into(),
                input,
                location,
            },
        );
    }

    /// Approve a tool, optionally replacing its input.
    pub fn confirm(&mut self, tool_id: &str, updated_input: Option<Value>) -> Result<SessionEvent, GateError> {
        let entry = self.pending_entry(tool_id)?;
        entry.state = GateState::Confirmed;
        if let Some(input) = &updated_input {
            entry.input = input.clone();
        }
        let location = entry.location.clone();
        Ok(SessionEvent::ToolConfirmed {
            session_id: location.session_id,
            turn_id: location.turn_id,
            round_id: location.round_id,
            tool_id: tool_id.to_string(),
            updated_input,
        })
    }

    /// Reject a tool. Terminal; sibling tools are unaffected.
    pub fn reject(&mut self, tool_id: &str) -> Result<SessionEvent, GateError> {
        let entry = self.pending_entry(tool_id)?;
        entry.state = GateState::Rejected;
        let location = entry.location.clone();
        Ok(SessionEvent::ToolRejected {
            session_id: location.session_id,
            turn_id: location.turn_id,
            round_id: location.round_id,
            tool_id: tool_id.to_string(),
        })
    }

    pub fn mark_running(&mut self, tool_id: &str) {
        if let Some(entry) = self.entries.get_mut(tool_id) {
            if entry.state == GateState::Confirmed {
                entry.state = GateState::Running;
            }
        }
    }

    pub fn mark_finished(&mut self, tool_id: &str, is_error: bool) {
        if let Some(entry) = self.entries.get_mut(tool_id) {
            if matches!(entry.state, GateState::Confirmed | GateState::Running) {
                entry.state = if is_error { GateState::Error } else { GateState::Completed };
            }
        }
    }

    pub fn state(&self, tool_id: &str) -> Option<GateState> {
        self.entries.get(tool_id).map(|entry| entry.state)
    }

    /// Tools still waiting for the user, in no particular order
    pub fn pending(&self) -> Vec<PendingTool> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == GateState::PendingConfirmation)
            .map(|(tool_id, entry)| PendingTool {
                tool_id: tool_id.clone(),
                tool_name: entry.tool_name.clone(),
                input: entry.input.clone(),
                location: entry.location.clone(),
            })
            .collect()
    }

    /// Forget tools whose turn finished or was dropped
    pub fn release<'a>(&mut self, tool_ids: impl IntoIterator<Item = &'a String>) {
        for tool_id in tool_ids {
            self.entries.remove(tool_id);
        }
    }

    fn pending_entry(&mut self, tool_id: &str) -> Result<&mut GateEntry, GateError> {
        let entry = self
            .entries
            .get_mut(tool_id)
            .ok_or_else(|| GateError::UnknownTool(tool_id.to_string()))?;
        if entry.state != GateState::PendingConfirmation {
            return Err(GateError::AlreadyResolved {
                tool_id: tool_id.to_string(),
                state: entry.state,
            });
        }
        Ok(entry)
    }
}
