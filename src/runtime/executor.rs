//! Core runtime: the event loop and effect execution

use super::traits::Collaborators;
use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::confirmation::{ConfirmError, ConfirmationGate, PendingTool, ToolLocation};
use crate::dispatcher::context::ContextItem;
use crate::dispatcher::{DispatchError, MessageDispatcher, OutgoingMessage, SendReceipt};
use crate::flow::{Session, SessionStatus};
use crate::retry_queue::{QueuedMessage, RetryDecision, RetryQueue};
use crate::rollback::{RollbackCoordinator, RollbackError, RollbackOutcome};
use crate::runtime::{CollaboratorError, TurnSnapshot};
use crate::session_manager::SessionManager;
use crate::state_machine::{ApplyError, Effect, SessionEvent};
use crate::stream::{parse_fragment, ParsedChunk, StreamFragment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Input to the event loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Raw fragment from the model stream
    Fragment(StreamFragment),
    /// Lifecycle event from the stream source
    Event(SessionEvent),
}

/// Result of one replay attempt from the retry queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAttempt {
    Sent,
    Requeued { retry_count: u32 },
    GaveUp { retry_count: u32 },
    /// The local turn is gone or closed; nothing was sent
    Abandoned,
}

/// State shared by the runtime and the components it drives
#[derive(Clone)]
pub struct CoreContext {
    pub(crate) manager: Arc<RwLock<SessionManager>>,
    pub(crate) gate: Arc<Mutex<ConfirmationGate>>,
    pub(crate) bus: EventBus,
    pub(crate) collaborators: Collaborators,
    pub(crate) config: Arc<CoreConfig>,
}

impl CoreContext {
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Self {
        Self {
            manager: Arc::new(RwLock::new(SessionManager::new())),
            gate: Arc::new(Mutex::new(ConfirmationGate::new())),
            bus: EventBus::new(config.event_bus_capacity),
            collaborators,
            config: Arc::new(config),
        }
    }

    /// Apply one event under the write lock, then run its effects with the
    /// lock released.
    pub async fn apply(&self, event: SessionEvent) -> Result<(), ApplyError> {
        let tool_progress = match &event {
            SessionEvent::ToolStarted { tool_id, .. } => Some((tool_id.clone(), None)),
            SessionEvent::Chunk {
                chunk: ParsedChunk::ToolResult { id, result },
                ..
            } => Some((id.clone(), Some(result.is_error()))),
            _ => None,
        };

        let effects = self.manager.write().await.apply_event(event)?;

        if let Some((tool_id, finished)) = tool_progress {
            let mut gate = self.gate.lock().await;
            match finished {
                None => gate.mark_running(&tool_id),
                Some(is_error) => gate.mark_finished(&tool_id, is_error),
            }
        }
        self.execute(effects).await;
        Ok(())
    }

    pub async fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.execute_effect(effect).await;
        }
    }

    async fn execute_effect(&self, effect: Effect) {
        let agent = &self.collaborators.agent;
        match effect {
            Effect::Notify(event) => self.bus.publish(event),

            Effect::RequestSnapshot { session_id, turn_index } => {
                // fire and forget; a failed snapshot never affects the turn
                let store = Arc::clone(&self.collaborators.snapshots);
                tokio::spawn(async move {
                    if let Err(e) = store.create_snapshot(&session_id, turn_index).await {
                        tracing::warn!(session_id = %session_id, turn_index, error = %e, "Snapshot creation failed");
                    }
                });
            }

            Effect::AwaitConfirmation {
                session_id,
                turn_id,
                round_id,
                tool_id,
                tool_name,
                input,
            } => {
                self.gate.lock().await.register(
                    tool_id,
                    tool_name,
                    input,
                    ToolLocation {
                        session_id,
                        turn_id,
                        round_id,
                    },
                );
            }

            Effect::ResumeTool {
                session_id,
                turn_id,
                tool_id,
                input,
            } => {
                if let Err(e) = agent.resume_tool(&session_id, &turn_id, &tool_id, &input).await {
                    tracing::error!(session_id = %session_id, tool_id = %tool_id, error = %e, "Failed to resume tool");
                }
            }

            Effect::SkipTool {
                session_id,
                turn_id,
                tool_id,
            } => {
                if let Err(e) = agent.skip_tool(&session_id, &turn_id, &tool_id).await {
                    tracing::error!(session_id = %session_id, tool_id = %tool_id, error = %e, "Failed to skip tool");
                }
            }

            Effect::CancelExecution { session_id, turn_id } => {
                if let Err(e) = agent.cancel_turn(&session_id, &turn_id).await {
                    tracing::error!(session_id = %session_id, turn_id = %turn_id, error = %e, "Failed to cancel execution");
                }
            }

            Effect::ReleaseTurn { tool_ids, .. } => {
                if !tool_ids.is_empty() {
                    self.gate.lock().await.release(&tool_ids);
                }
            }
        }
    }
}

/// Owns every component; dropping it tears the core down.
pub struct CoreRuntime {
    ctx: CoreContext,
    dispatcher: MessageDispatcher,
    rollback: RollbackCoordinator,
    retry_queue: Mutex<RetryQueue>,
    shutdown: CancellationToken,
}

impl CoreRuntime {
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Self {
        let retry_queue = RetryQueue::new(config.max_retries);
        let ctx = CoreContext::new(config, collaborators);
        Self {
            dispatcher: MessageDispatcher::new(ctx.clone()),
            rollback: RollbackCoordinator::new(ctx.clone()),
            retry_queue: Mutex::new(retry_queue),
            shutdown: CancellationToken::new(),
            ctx,
        }
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn config(&self) -> &CoreConfig {
        &self.ctx.config
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Channel pair for [`CoreRuntime::run`]
    pub fn inbox(&self) -> (mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>) {
        mpsc::channel(self.ctx.config.inbox_capacity)
    }

    /// Process inbound messages in arrival order until the inbox closes or
    /// [`CoreRuntime::shutdown`] is called.
    pub async fn run(&self, mut inbox: mpsc::Receiver<Inbound>) {
        tracing::info!("Starting core runtime");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                inbound = inbox.recv() => match inbound {
                    Some(inbound) => self.handle(inbound).await,
                    None => break,
                },
            }
        }
        tracing::info!("Core runtime stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn handle(&self, inbound: Inbound) {
        match inbound {
            Inbound::Fragment(fragment) => self.ingest(fragment).await,
            Inbound::Event(event) => {
                let name = event.name();
                if let Err(e) = self.ctx.apply(event).await {
                    tracing::warn!(event = name, error = %e, "Dropping event");
                }
            }
        }
    }

    /// Parse and apply one stream fragment. Malformed or misaddressed
    /// fragments are logged and dropped.
    pub async fn ingest(&self, fragment: StreamFragment) {
        let chunk = match parse_fragment(&fragment) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(
                    session_id = %fragment.session_id,
                    turn_id = %fragment.turn_id,
                    round_id = %fragment.round_id,
                    error = %e,
                    "Dropping malformed fragment"
                );
                return;
            }
        };
        let event = SessionEvent::Chunk {
            session_id: fragment.session_id,
            turn_id: fragment.turn_id,
            round_id: fragment.round_id,
            chunk,
        };
        if let Err(e) = self.ctx.apply(event).await {
            tracing::warn!(error = %e, "Dropping fragment");
        }
    }

    /// Apply a lifecycle event, reporting why it was dropped
    pub async fn apply(&self, event: SessionEvent) -> Result<(), ApplyError> {
        self.ctx.apply(event).await
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.ctx.manager.read().await.get_session(session_id)
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.ctx.manager.read().await.list_sessions()
    }

    pub async fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.ctx.manager.read().await.derive_status(session_id)
    }

    pub async fn active_session_id(&self) -> Option<String> {
        self.ctx.manager.read().await.active_session_id().map(str::to_string)
    }

    pub async fn switch_session(&self, session_id: &str) -> Result<(), ApplyError> {
        let effects = self.ctx.manager.write().await.switch_session(session_id)?;
        self.ctx.execute(effects).await;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ApplyError> {
        let effects = self.ctx.manager.write().await.delete_session(session_id)?;
        self.ctx.execute(effects).await;
        self.discard_orphaned_retries().await;
        Ok(())
    }

    pub async fn execution_token(&self, turn_id: &str) -> Option<CancellationToken> {
        self.ctx.manager.read().await.execution_token(turn_id)
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Send a message; `agent_type` falls back to the configured default.
    pub async fn send_message(
        &self,
        text: &str,
        contexts: &mut Vec<ContextItem>,
        agent_type: Option<&str>,
    ) -> Result<SendReceipt, DispatchError> {
        let agent_type = agent_type.unwrap_or(&self.ctx.config.default_agent_type);
        self.dispatcher.send_message(text, contexts, agent_type).await
    }

    pub async fn cancel_turn(&self, session_id: &str, turn_id: &str) -> Result<(), ApplyError> {
        self.ctx
            .apply(SessionEvent::CancelRequested {
                session_id: session_id.to_string(),
                turn_id: turn_id.to_string(),
            })
            .await
    }

    pub async fn confirm_tool(&self, tool_id: &str, updated_input: Option<Value>) -> Result<(), ConfirmError> {
        let event = self.ctx.gate.lock().await.confirm(tool_id, updated_input)?;
        self.resolve_tool(tool_id, event).await
    }

    pub async fn reject_tool(&self, tool_id: &str) -> Result<(), ConfirmError> {
        let event = self.ctx.gate.lock().await.reject(tool_id)?;
        self.resolve_tool(tool_id, event).await
    }

    async fn resolve_tool(&self, tool_id: &str, event: SessionEvent) -> Result<(), ConfirmError> {
        if let Err(e) = self.ctx.apply(event).await {
            tracing::warn!(tool_id = %tool_id, error = %e, "Tool decision no longer applies, releasing");
            self.ctx.gate.lock().await.release([&tool_id.to_string()]);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn pending_confirmations(&self) -> Vec<PendingTool> {
        self.ctx.gate.lock().await.pending()
    }

    pub async fn rollback_to_turn(&self, session_id: &str, turn_index: usize) -> Result<RollbackOutcome, RollbackError> {
        let outcome = self.rollback.rollback_to_turn(session_id, turn_index).await?;
        if matches!(outcome, RollbackOutcome::RolledBack { .. }) {
            self.discard_orphaned_retries().await;
        }
        Ok(outcome)
    }

    pub async fn list_snapshots(&self, session_id: &str) -> Result<Vec<TurnSnapshot>, CollaboratorError> {
        self.rollback.list_snapshots(session_id).await
    }

    // ========================================================================
    // Retry queue
    // ========================================================================

    /// Queue a message the backend rejected. Idempotent per local turn.
    pub async fn queue_for_retry(&self, message: OutgoingMessage) -> QueuedMessage {
        self.retry_queue.lock().await.enqueue(message).clone()
    }

    pub async fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.retry_queue.lock().await.entries().to_vec()
    }

    /// Make one attempt for every queued message.
    ///
    /// A message out of attempts fails its local turn. A message whose turn
    /// was dropped or closed is abandoned without sending. Completed entries
    /// are pruned afterwards.
    pub async fn retry_pending(&self) -> Vec<(String, RetryAttempt)> {
        let ready = self.retry_queue.lock().await.take_ready();
        let mut attempts = Vec::with_capacity(ready.len());
        for message in ready {
            let turn_id = message.local_turn_id.clone();
            let attempt = match self.dispatcher.redeliver(&message).await {
                Ok(()) => {
                    self.retry_queue.lock().await.mark_succeeded(&turn_id);
                    RetryAttempt::Sent
                }
                Err(DispatchError::Session(e)) => {
                    self.abandon_retry(&turn_id, &e).await;
                    RetryAttempt::Abandoned
                }
                Err(e) => {
                    let decision = self.retry_queue.lock().await.mark_failed(&turn_id, e.to_string());
                    match decision {
                        Some(RetryDecision::Requeued { retry_count }) => RetryAttempt::Requeued { retry_count },
                        Some(RetryDecision::GaveUp { retry_count }) => {
                            self.fail_undelivered(&message, retry_count, &e).await;
                            RetryAttempt::GaveUp { retry_count }
                        }
                        None => continue,
                    }
                }
            };
            attempts.push((turn_id, attempt));
        }
        self.retry_queue.lock().await.prune_completed();
        attempts
    }

    async fn abandon_retry(&self, turn_id: &str, reason: &ApplyError) {
        tracing::info!(turn_id = %turn_id, reason = %reason, "Abandoning queued message");
        let mut queue = self.retry_queue.lock().await;
        if matches!(reason, ApplyError::UnknownTurn { .. }) {
            queue.discard(turn_id);
        } else {
            queue.mark_abandoned(turn_id, reason.to_string());
        }
    }

    /// Drop queued messages whose local turn no longer exists
    async fn discard_orphaned_retries(&self) {
        let queued: Vec<(String, String)> = self
            .retry_queue
            .lock()
            .await
            .entries()
            .iter()
            .map(|entry| (entry.message.session_id.clone(), entry.local_dialog_turn_id.clone()))
            .collect();
        let orphaned: Vec<String> = {
            let manager = self.ctx.manager.read().await;
            queued
                .into_iter()
                .filter(|(session_id, turn_id)| manager.turn_status(session_id, turn_id).is_none())
                .map(|(_, turn_id)| turn_id)
                .collect()
        };
        if orphaned.is_empty() {
            return;
        }
        let mut queue = self.retry_queue.lock().await;
        for turn_id in &orphaned {
            queue.discard(turn_id);
        }
        tracing::info!(count = orphaned.len(), "Discarded queued messages of dropped turns");
    }

    async fn fail_undelivered(&self, message: &OutgoingMessage, retry_count: u32, error: &DispatchError) {
        let event = SessionEvent::TurnFailed {
            session_id: message.session_id.clone(),
            turn_id: message.local_turn_id.clone(),
            error: format!("Message not delivered after {retry_count} retries: {error}"),
        };
        if let Err(e) = self.ctx.apply(event).await {
            tracing::warn!(turn_id = %message.local_turn_id, error = %e, "Could not mark undelivered turn as failed");
        }
    }
}
