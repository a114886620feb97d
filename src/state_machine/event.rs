//! Events that mutate the conversation tree

use crate::flow::{ImageAnalysisOutcome, SessionConfig, TokenUsage, UserMessage};
use crate::stream::ParsedChunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every change to a session goes through one of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    // Session lifecycle
    SessionCreated {
        session_id: String,
        config: SessionConfig,
    },

    // Turn lifecycle
    TurnStarted {
        session_id: String,
        turn_id: String,
        user_message: UserMessage,
    },
    ImageAnalysisCompleted {
        session_id: String,
        turn_id: String,
        image_id: String,
        outcome: ImageAnalysisOutcome,
    },
    TurnEnded {
        session_id: String,
        turn_id: String,
    },
    TurnFailed {
        session_id: String,
        turn_id: String,
        error: String,
    },
    CancelRequested {
        session_id: String,
        turn_id: String,
    },
    TokenUsage {
        session_id: String,
        turn_id: String,
        usage: TokenUsage,
    },

    // Round lifecycle
    RoundStarted {
        session_id: String,
        turn_id: String,
        round_id: String,
    },
    Chunk {
        session_id: String,
        turn_id: String,
        round_id: String,
        chunk: ParsedChunk,
    },
    RoundEnded {
        session_id: String,
        turn_id: String,
        round_id: String,
    },
    RoundFailed {
        session_id: String,
        turn_id: String,
        round_id: String,
        error: String,
    },
    /// The agent acknowledged cancellation of this round
    RoundCancelled {
        session_id: String,
        turn_id: String,
        round_id: String,
    },

    // Tool confirmation
    ToolConfirmed {
        session_id: String,
        turn_id: String,
        round_id: String,
        tool_id: String,
        updated_input: Option<Value>,
    },
    ToolRejected {
        session_id: String,
        turn_id: String,
        round_id: String,
        tool_id: String,
    },
    ToolStarted {
        session_id: String,
        turn_id: String,
        round_id: String,
        tool_id: String,
    },

    /// Drop every turn after `keep_through`
    TurnsTruncated {
        session_id: String,
        keep_through: usize,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::SessionCreated { session_id, .. }
            | SessionEvent::TurnStarted { session_id, .. }
            | SessionEvent::ImageAnalysisCompleted { session_id, .. }
            | SessionEvent::TurnEnded { session_id, .. }
            | SessionEvent::TurnFailed { session_id, .. }
            | SessionEvent::CancelRequested { session_id, .. }
            | SessionEvent::TokenUsage { session_id, .. }
            | SessionEvent::RoundStarted { session_id, .. }
            | SessionEvent::Chunk { session_id, .. }
            | SessionEvent::RoundEnded { session_id, .. }
            | SessionEvent::RoundFailed { session_id, .. }
            | SessionEvent::RoundCancelled { session_id, .. }
            | SessionEvent::ToolConfirmed { session_id, .. }
            | SessionEvent::ToolRejected { session_id, .. }
            | SessionEvent::ToolStarted { session_id, .. }
            | SessionEvent::TurnsTruncated { session_id, .. } => session_id,
        }
    }

    /// The turn this event addresses, if any
    pub fn turn_id(&self) -> Option<&str> {
        match self {
            SessionEvent::SessionCreated { .. } | SessionEvent::TurnsTruncated { .. } => None,
            SessionEvent::TurnStarted { turn_id, .. }
            | SessionEvent::ImageAnalysisCompleted { turn_id, .. }
            | SessionEvent::TurnEnded { turn_id, .. }
            | SessionEvent::TurnFailed { turn_id, .. }
            | SessionEvent::CancelRequested { turn_id, .. }
            | SessionEvent::TokenUsage { turn_id, .. }
            | SessionEvent::RoundStarted { turn_id, .. }
            | SessionEvent::Chunk { turn_id, .. }
            | SessionEvent::RoundEnded { turn_id, .. }
            | SessionEvent::RoundFailed { turn_id, .. }
            | SessionEvent::RoundCancelled { turn_id, .. }
            | SessionEvent::ToolConfirmed { turn_id, .. }
            | SessionEvent::ToolRejected { turn_id, .. }
            | SessionEvent::ToolStarted { turn_id, .. } => Some(turn_id),
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session_created",
            SessionEvent::TurnStarted { .. } => "turn_started",
            SessionEvent::ImageAnalysisCompleted { .. } => "image_analysis_completed",
            SessionEvent::TurnEnded { .. } => "turn_ended",
            SessionEvent::TurnFailed { .. } => "turn_failed",
            SessionEvent::CancelRequested { .. } => "cancel_requested",
            SessionEvent::TokenUsage { .. } => "token_usage",
            SessionEvent::RoundStarted { .. } => "round_started",
            SessionEvent::Chunk { .. } => "chunk",
            SessionEvent::RoundEnded { .. } => "round_ended",
            SessionEvent::RoundFailed { .. } => "round_failed",
            SessionEvent::RoundCancelled { .. } => "round_cancelled",
            SessionEvent::ToolConfirmed { .. } => "tool_confirmed",
            SessionEvent::ToolRejected { .. } => "tool_rejected",
            SessionEvent::ToolStarted { .. } => "tool_started",
            SessionEvent::TurnsTruncated { .. } => "turns_truncated",
        }
    }
}
