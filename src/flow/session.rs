//! Sessions and the single place session status is derived

use super::turn::{DialogTurn, TurnStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived session status. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Error,
}

/// Settings a session is created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model_id: String,
    /// Agent/tool profile the session runs in
    pub agent_type: String,
    pub max_context_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub turns: Vec<DialogTurn>,
    pub mode: String,
    pub model_id: String,
    pub current_token_usage: u64,
    pub max_context_tokens: u64,
    pub created_at: DateTime<Utc>,
    /// Turn that received the latest event
    pub last_touched_turn_id: Option<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            session_id: session_id.into(),
            turns: Vec::new(),
            mode: config.agent_type.clone(),
            model_id: config.model_id.clone(),
            current_token_usage: 0,
            max_context_tokens: config.max_context_tokens,
            created_at: Utc::now(),
            last_touched_turn_id: None,
        }
    }

    pub fn turn(&self, turn_id: &str) -> Option<&DialogTurn> {
        self.turns.iter().find(|turn| turn.id == turn_id)
    }

    pub fn turn_mut(&mut self, turn_id: &str) -> Option<&mut DialogTurn> {
        self.turns.iter_mut().find(|turn| turn.id == turn_id)
    }

    pub fn turn_index(&self, turn_id: &str) -> Option<usize> {
        self.turns.iter().position(|turn| turn.id == turn_id)
    }

    pub fn latest_turn_index(&self) -> Option<usize> {
        self.turns.len().checked_sub(1)
    }

    pub fn last_touched_turn(&self) -> Option<&DialogTurn> {
        self.last_touched_turn_id
            .as_deref()
            .and_then(|id| self.turn(id))
            .or_else(|| self.turns.last())
    }

    /// Keep turns `[0, turn_index]`, returning the ids of dropped turns.
    pub fn truncate_after(&mut self, turn_index: usize) -> Vec<String> {
        let dropped: Vec<String> = self
            .turns
            .drain((turn_index + 1).min(self.turns.len())..)
            .map(|turn| turn.id)
            .collect();
        let touched_gone = self
            .last_touched_turn_id
            .as_ref()
            .is_some_and(|id| dropped.contains(id));
        if touched_gone {
            self.last_touched_turn_id = self.turns.last().map(|turn| turn.id.clone());
        }
        dropped
    }
}

/// Pure status derivation.
///
/// `active` when the session holds UI focus, `error` when its most
/// recently touched turn failed, `idle` otherwise.
pub fn derive_status(session: &Session, active_session_id: Option<&str>) -> SessionStatus {
    if active_session_id == Some(session.session_id.as_str()) {
        return SessionStatus::Active;
    }
    match session.last_touched_turn() {
        Some(turn) if turn.status == TurnStatus::Error => SessionStatus::Error,
        _ => SessionStatus::Idle,
    }
}
