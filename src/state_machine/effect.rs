//! Effects produced by applying events

use crate::bus::CoreEvent;
use serde_json::Value;

/// Work for the runtime once the state change is committed
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish on the event bus
    Notify(CoreEvent),

    /// Snapshot the workspace for a turn that just finished
    RequestSnapshot { session_id: String, turn_index: usize },

    /// Hold a tool at the confirmation gate
    AwaitConfirmation {
        session_id: String,
        turn_id: String,
        round_id: String,
        tool_id: String,
        tool_name: String,
        input: Value,
    },

    /// Let the agent run a confirmed tool
    ResumeTool {
        session_id: String,
        turn_id: String,
        tool_id: String,
        input: Value,
    },

    /// Tell the agent a tool was rejected
    SkipTool {
        session_id: String,
        turn_id: String,
        tool_id: String,
    },

    /// Stop the agent execution behind a turn
    CancelExecution { session_id: String, turn_id: String },

    /// A turn finished or was dropped; forget its per-turn resources
    ReleaseTurn {
        session_id: String,
        turn_id: String,
        tool_ids: Vec<String>,
    },
}

impl Effect {
    pub fn session_updated(session_id: &str) -> Self {
        Effect::Notify(CoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        })
    }
}
