//! Owner of every session tree
//!
//! All mutation goes through [`SessionManager::apply_event`]. Readers get
//! clones, so nothing outside this module holds a reference into the tree.

use crate::bus::CoreEvent;
use crate::flow::{derive_status, Session, SessionStatus, TurnStatus};
use crate::state_machine::{transition, ApplyError, Effect, SessionEvent};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    active_session_id: Option<String>,
    /// Cooperative cancellation for the agent execution behind each open turn
    execution_tokens: HashMap<String, CancellationToken>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one event to its session.
    pub fn apply_event(&mut self, event: SessionEvent) -> Result<Vec<Effect>, ApplyError> {
        if let SessionEvent::SessionCreated { session_id, config } = event {
            if self.sessions.contains_key(&session_id) {
                return Err(ApplyError::DuplicateSession(session_id));
            }
            tracing::info!(session_id = %session_id, model = %config.model_id, "Session created");
            let effects = vec![Effect::session_updated(&session_id)];
            self.sessions
                .insert(session_id.clone(), Session::new(session_id, &config));
            return Ok(effects);
        }

        let session_id = event.session_id().to_string();
        let started_turn = match &event {
            SessionEvent::TurnStarted { turn_id, .. } => Some(turn_id.clone()),
            _ => None,
        };
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| ApplyError::UnknownSession(session_id.clone()))?;

        tracing::debug!(session_id = %session_id, event = event.name(), "Applying event");
        let result = transition(session, event)?;
        if !result.changed {
            return Ok(result.effects);
        }

        if let Some(turn_id) = started_turn {
            self.execution_tokens.entry(turn_id).or_default();
        }
        for effect in &result.effects {
            match effect {
                Effect::CancelExecution { turn_id, .. } => {
                    if let Some(token) = self.execution_tokens.get(turn_id) {
                        token.cancel();
                    }
                }
                Effect::ReleaseTurn { turn_id, .. } => {
                    // stops executions of truncated turns; no-op for finished ones
                    if let Some(token) = self.execution_tokens.remove(turn_id) {
                        token.cancel();
                    }
                }
                _ => {}
            }
        }

        let mut effects = result.effects;
        effects.push(Effect::session_updated(&session_id));
        Ok(effects)
    }

    /// Register a new empty session
    pub fn create_session(
        &mut self,
        session_id: impl Into<String>,
        config: crate::flow::SessionConfig,
    ) -> Result<Vec<Effect>, ApplyError> {
        self.apply_event(SessionEvent::SessionCreated {
            session_id: session_id.into(),
            config,
        })
    }

    /// Remove a session, stopping whatever still runs in it.
    pub fn delete_session(&mut self, session_id: &str) -> Result<Vec<Effect>, ApplyError> {
        let session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| ApplyError::UnknownSession(session_id.to_string()))?;
        let mut effects = Vec::new();
        for turn in &session.turns {
            if let Some(token) = self.execution_tokens.remove(&turn.id) {
                token.cancel();
            }
            effects.push(Effect::ReleaseTurn {
                session_id: session_id.to_string(),
                turn_id: turn.id.clone(),
                tool_ids: turn
                    .model_rounds
                    .iter()
                    .flat_map(|round| round.items.iter().filter_map(crate::flow::FlowItem::as_tool))
                    .map(|tool| tool.id.clone())
                    .collect(),
            });
        }
        if self.active_session_id.as_deref() == Some(session_id) {
            self.active_session_id = None;
            effects.push(Effect::Notify(CoreEvent::ActiveSessionChanged { session_id: None }));
        }
        tracing::info!(session_id = %session_id, turns = session.turns.len(), "Session deleted");
        Ok(effects)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// All sessions, oldest first
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn derive_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions
            .get(session_id)
            .map(|session| derive_status(session, self.active_session_id.as_deref()))
    }

    /// Change which session has UI focus. Other sessions keep streaming.
    pub fn switch_session(&mut self, session_id: &str) -> Result<Vec<Effect>, ApplyError> {
        if !self.sessions.contains_key(session_id) {
            return Err(ApplyError::UnknownSession(session_id.to_string()));
        }
        if self.active_session_id.as_deref() == Some(session_id) {
            return Ok(Vec::new());
        }
        self.active_session_id = Some(session_id.to_string());
        Ok(vec![Effect::Notify(CoreEvent::ActiveSessionChanged {
            session_id: Some(session_id.to_string()),
        })])
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    pub fn turn_index(&self, session_id: &str, turn_id: &str) -> Option<usize> {
        self.sessions.get(session_id)?.turn_index(turn_id)
    }

    pub fn turn_status(&self, session_id: &str, turn_id: &str) -> Option<TurnStatus> {
        self.sessions.get(session_id)?.turn(turn_id).map(|turn| turn.status)
    }

    pub fn turn_count(&self, session_id: &str) -> Option<usize> {
        self.sessions.get(session_id).map(|session| session.turns.len())
    }

    /// Token the agent execution for `turn_id` should observe
    pub fn execution_token(&self, turn_id: &str) -> Option<CancellationToken> {
        self.execution_tokens.get(turn_id).cloned()
    }
}
