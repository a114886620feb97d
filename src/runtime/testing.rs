//! Mock collaborators for testing
//!
//! These mocks let the runtime run end to end without an agent, a backend
//! or a workspace.

use super::executor::CoreRuntime;
use super::traits::*;
use crate::config::CoreConfig;
use crate::dispatcher::OutgoingMessage;
use crate::flow::SessionConfig;
use crate::state_machine::SessionEvent;
use crate::stream::StreamFragment;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock Session Bootstrap
// ============================================================================

/// Hands out `session-1`, `session-2`, ... for the configured model
#[allow(dead_code)]
pub struct MockBootstrap {
    model: Option<String>,
    created: Mutex<Vec<SessionConfig>>,
}

#[allow(dead_code)]
impl MockBootstrap {
    pub fn new(model: Option<&str>) -> Self {
        Self {
            model: model.map(String::from),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<SessionConfig> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionBootstrap for MockBootstrap {
    async fn create_session(&self, config: &SessionConfig) -> Result<String, CollaboratorError> {
        let mut created = self.created.lock().unwrap();
        created.push(config.clone());
        Ok(format!("session-{}", created.len()))
    }

    async fn resolve_default_model(&self) -> Option<String> {
        self.model.clone()
    }
}

// ============================================================================
// Mock Image Uploader
// ============================================================================

/// Assigns `img-<context id>` to every upload unless told to fail
#[allow(dead_code)]
pub struct MockUploader {
    fail_with: Mutex<Option<CollaboratorError>>,
    pub uploads: Mutex<Vec<ImageUpload>>,
}

#[allow(dead_code)]
impl MockUploader {
    pub fn new() -> Self {
        Self {
            fail_with: Mutex::new(None),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_with(&self, error: CollaboratorError) {
        *self.fail_with.lock().unwrap() = Some(error);
    }

    pub fn recorded_uploads(&self) -> Vec<ImageUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageUploader for MockUploader {
    async fn upload_image_contexts(
        &self,
        _session_id: &str,
        images: &[ImageUpload],
    ) -> Result<Vec<UploadedImage>, CollaboratorError> {
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }
        self.uploads.lock().unwrap().extend(images.iter().cloned());
        Ok(images
            .iter()
            .map(|image| UploadedImage {
                context_id: image.context_id.clone(),
                image_id: format!("img-{}", image.context_id),
            })
            .collect())
    }
}

// ============================================================================
// Mock Upstream
// ============================================================================

/// Accepts every message unless rejections are queued
#[allow(dead_code)]
pub struct MockUpstream {
    results: Mutex<VecDeque<Result<(), CollaboratorError>>>,
    pub sent: Mutex<Vec<OutgoingMessage>>,
}

#[allow(dead_code)]
impl MockUpstream {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Reject the next `count` sends
    pub fn queue_rejections(&self, count: usize) {
        let mut results = self.results.lock().unwrap();
        for _ in 0..count {
            results.push_back(Err(CollaboratorError::Unavailable("backend busy".into())));
        }
    }

    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamSender for MockUpstream {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(message.clone());
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

// ============================================================================
// Mock Snapshot Store
// ============================================================================

#[allow(dead_code)]
pub struct MockSnapshotStore {
    pub created: Mutex<Vec<(String, usize)>>,
    pub restores: Mutex<Vec<(String, usize)>>,
    restore_result: Mutex<Result<Vec<String>, CollaboratorError>>,
}

#[allow(dead_code)]
impl MockSnapshotStore {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            restore_result: Mutex::new(Ok(Vec::new())),
        }
    }

    pub fn set_restore_result(&self, result: Result<Vec<String>, CollaboratorError>) {
        *self.restore_result.lock().unwrap() = result;
    }

    pub fn created_snapshots(&self) -> Vec<(String, usize)> {
        self.created.lock().unwrap().clone()
    }

    pub fn restore_count(&self) -> usize {
        self.restores.lock().unwrap().len()
    }

    /// Snapshots are created on spawned tasks; yield until `count` exist.
    pub async fn wait_for_created(&self, count: usize) -> Vec<(String, usize)> {
        for _ in 0..100 {
            if self.created.lock().unwrap().len() >= count {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.created_snapshots()
    }
}

#[async_trait]
impl SnapshotStore for MockSnapshotStore {
    async fn create_snapshot(&self, session_id: &str, turn_index: usize) -> Result<(), CollaboratorError> {
        self.created.lock().unwrap().push((session_id.to_string(), turn_index));
        Ok(())
    }

    async fn restore_to_turn(&self, session_id: &str, turn_index: usize) -> Result<Vec<String>, CollaboratorError> {
        self.restores.lock().unwrap().push((session_id.to_string(), turn_index));
        self.restore_result.lock().unwrap().clone()
    }

    async fn list_snapshots(&self, session_id: &str) -> Result<Vec<TurnSnapshot>, CollaboratorError> {
        Ok(self
            .created_snapshots()
            .into_iter()
            .filter(|(id, _)| id == session_id)
            .map(|(session_id, turn_index)| TurnSnapshot {
                session_id,
                turn_index,
                modified_files: Vec::new(),
                timestamp: Utc::now(),
            })
            .collect())
    }
}

// ============================================================================
// Mock Agent Control
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Resume { tool_id: String, input: Value },
    Skip { tool_id: String },
    Cancel { turn_id: String },
}

#[allow(dead_code)]
pub struct MockAgentControl {
    pub calls: Mutex<Vec<AgentCall>>,
}

#[allow(dead_code)]
impl MockAgentControl {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded_calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentControl for MockAgentControl {
    async fn resume_tool(
        &self,
        _session_id: &str,
        _turn_id: &str,
        tool_id: &str,
        input: &Value,
    ) -> Result<(), CollaboratorError> {
        self.calls.lock().unwrap().push(AgentCall::Resume {
            tool_id: tool_id.to_string(),
            input: input.clone(),
        });
        Ok(())
    }

    async fn skip_tool(&self, _session_id: &str, _turn_id: &str, tool_id: &str) -> Result<(), CollaboratorError> {
        self.calls.lock().unwrap().push(AgentCall::Skip {
            tool_id: tool_id.to_string(),
        });
        Ok(())
    }

    async fn cancel_turn(&self, _session_id: &str, turn_id: &str) -> Result<(), CollaboratorError> {
        self.calls.lock().unwrap().push(AgentCall::Cancel {
            turn_id: turn_id.to_string(),
        });
        Ok(())
    }
}

// ============================================================================
// Test Runtime
// ============================================================================

/// A runtime wired to mocks, with handles to inspect them
#[allow(dead_code)]
pub struct TestRuntime {
    pub runtime: CoreRuntime,
    pub bootstrap: Arc<MockBootstrap>,
    pub uploader: Arc<MockUploader>,
    pub upstream: Arc<MockUpstream>,
    pub snapshots: Arc<MockSnapshotStore>,
    pub agent: Arc<MockAgentControl>,
}

#[allow(dead_code)]
pub struct TestRuntimeBuilder {
    config: CoreConfig,
    model: Option<String>,
}

#[allow(dead_code)]
impl TestRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            model: Some("test-model".to_string()),
        }
    }

    pub fn without_model(mut self) -> Self {
        self.model = None;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn build(self) -> TestRuntime {
        let bootstrap = Arc::new(MockBootstrap::new(self.model.as_deref()));
        let uploader = Arc::new(MockUploader::new());
        let upstream = Arc::new(MockUpstream::new());
        let snapshots = Arc::new(MockSnapshotStore::new());
        let agent = Arc::new(MockAgentControl::new());
        let collaborators = Collaborators {
            bootstrap: bootstrap.clone(),
            uploader: uploader.clone(),
            upstream: upstream.clone(),
            snapshots: snapshots.clone(),
            agent: agent.clone(),
        };
        TestRuntime {
            runtime: CoreRuntime::new(self.config, collaborators),
            bootstrap,
            uploader,
            upstream,
            snapshots,
            agent,
        }
    }
}

#[allow(dead_code)]
impl TestRuntime {
    pub fn new() -> Self {
        TestRuntimeBuilder::new().build()
    }

    pub async fn create_session(&self, session_id: &str) {
        self.runtime
            .apply(SessionEvent::SessionCreated {
                session_id: session_id.to_string(),
                config: SessionConfig {
                    model_id: "test-model".into(),
                    agent_type: "agentic".into(),
                    max_context_tokens: 1000,
                },
            })
            .await
            .unwrap();
    }

    pub async fn start_turn(&self, session_id: &str, turn_id: &str) {
        self.runtime
            .apply(SessionEvent::TurnStarted {
                session_id: session_id.to_string(),
                turn_id: turn_id.to_string(),
                user_message: crate::flow::UserMessage::new(format!("message for {turn_id}")),
            })
            .await
            .unwrap();
    }

    pub async fn start_round(&self, session_id: &str, turn_id: &str, round_id: &str) {
        self.runtime
            .apply(SessionEvent::RoundStarted {
                session_id: session_id.to_string(),
                turn_id: turn_id.to_string(),
                round_id: round_id.to_string(),
            })
            .await
            .unwrap();
    }

    pub async fn end_round(&self, session_id: &str, turn_id: &str, round_id: &str) {
        self.runtime
            .apply(SessionEvent::RoundEnded {
                session_id: session_id.to_string(),
                turn_id: turn_id.to_string(),
                round_id: round_id.to_string(),
            })
            .await
            .unwrap();
    }

    pub async fn end_turn(&self, session_id: &str, turn_id: &str) {
        self.runtime
            .apply(SessionEvent::TurnEnded {
                session_id: session_id.to_string(),
                turn_id: turn_id.to_string(),
            })
            .await
            .unwrap();
    }

    /// Run a turn with one text round to completion
    pub async fn complete_turn(&self, session_id: &str, turn_id: &str) {
        let round_id = format!("{turn_id}-r1");
        self.start_turn(session_id, turn_id).await;
        self.start_round(session_id, turn_id, &round_id).await;
        self.runtime
            .ingest(fragment(session_id, turn_id, &round_id, "text", Value::from("done")))
            .await;
        self.end_round(session_id, turn_id, &round_id).await;
        self.end_turn(session_id, turn_id).await;
    }
}

pub fn fragment(session_id: &str, turn_id: &str, round_id: &str, kind: &str, payload: Value) -> StreamFragment {
    StreamFragment::new(session_id, turn_id, round_id, kind, payload)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CoreEvent;
    use crate::confirmation::{ConfirmError, GateError, GateState};
    use crate::dispatcher::context::ContextItem;
    use crate::dispatcher::DispatchError;
    use crate::flow::{FlowItem, ItemStatus, RoundStatus, SessionStatus, TurnStatus};
    use crate::retry_queue::QueueStatus;
    use crate::rollback::{RollbackError, RollbackOutcome};
    use crate::runtime::{Inbound, RetryAttempt};
    use crate::state_machine::ApplyError;
    use serde_json::json;
    use tokio::sync::broadcast::Receiver;

    fn drain(rx: &mut Receiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn without_session_updates(events: Vec<CoreEvent>) -> Vec<CoreEvent> {
        events
            .into_iter()
            .filter(|event| !matches!(event, CoreEvent::SessionUpdated { .. }))
            .collect()
    }

    fn tool_call(id: &str, requires_confirmation: bool) -> Value {
        json!({
            "id": id,
            "tool": "bash",
            "input": {"command": "ls"},
            "requires_confirmation": requires_confirmation,
        })
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_streamed_turn_completes_and_snapshots() {
        let t = TestRuntime::new();
        let rt = &t.runtime;
        let receipt = rt
            .send_message("list files", &mut Vec::new(), None)
            .await
            .unwrap();
        let (s, turn) = (receipt.session_id.as_str(), receipt.turn_id.as_str());
        assert_eq!(rt.session_status(s).await, Some(SessionStatus::Active));

        t.start_round(s, turn, "r1").await;
        rt.ingest(fragment(s, turn, "r1", "text", json!("Let me ")))
            .await;
        rt.ingest(fragment(s, turn, "r1", "text", json!({"text": "look.", "end": true})))
            .await;
        rt.ingest(fragment(s, turn, "r1", "tool_call", json!({"id": "tool-1", "tool": "bash"})))
            .await;
        rt.ingest(fragment(s, turn, "r1", "tool_call", json!({"id": "tool-1", "params_delta": "{\"command\": \"l"})))
            .await;
        rt.ingest(fragment(
            s,
            turn,
            "r1",
            "tool_call",
            json!({"id": "tool-1", "params_delta": "s\"}", "is_final": true}),
        ))
        .await;
        rt.ingest(fragment(s, turn, "r1", "tool_result", json!({"id": "tool-1", "result": "a.rs"})))
            .await;
        t.end_round(s, turn, "r1").await;
        t.end_turn(s, turn).await;

        let session = rt.get_session(s).await.unwrap();
        let dialog = &session.turns[0];
        assert_eq!(dialog.status, TurnStatus::Completed);
        let round = &dialog.model_rounds[0];
        assert_eq!(round.status, RoundStatus::Completed);
        match &round.items[0] {
            FlowItem::Text(text) => assert_eq!(text.content, "Let me look."),
            other => panic!("expected text, got {other:?}"),
        }
        let tool = round.tool("tool-1").unwrap();
        assert_eq!(tool.status, ItemStatus::Completed);
        assert_eq!(tool.tool_call.input, json!({"command": "ls"}));
        assert_eq!(tool.tool_result().unwrap().result, json!("a.rs"));

        assert_eq!(t.snapshots.wait_for_created(1).await, vec![(s.to_string(), 0)]);
        assert!(rt.execution_token(turn).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_misaddressed_fragments_are_dropped() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;

        let rt = &t.runtime;
        rt.ingest(fragment("s1", "t1", "r1", "bogus", json!({}))).await;
        rt.ingest(fragment("s1", "t1", "r1", "tool_call", json!({"id": ""}))).await;
        rt.ingest(fragment("s1", "t1", "missing", "text", json!("lost"))).await;
        rt.ingest(fragment("nope", "t1", "r1", "text", json!("lost"))).await;

        let session = rt.get_session("s1").await.unwrap();
        assert!(session.turns[0].model_rounds[0].items.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_processes_inbox_in_order() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        let rt = &t.runtime;
        let (tx, rx) = rt.inbox();

        let events = vec![
            Inbound::Event(SessionEvent::TurnStarted {
                session_id: "s1".into(),
                turn_id: "t1".into(),
                user_message: crate::flow::UserMessage::new("hi"),
            }),
            Inbound::Event(SessionEvent::RoundStarted {
                session_id: "s1".into(),
                turn_id: "t1".into(),
                round_id: "r1".into(),
            }),
            Inbound::Fragment(fragment("s1", "t1", "r1", "text", json!("a"))),
            Inbound::Fragment(fragment("s1", "t1", "r1", "text", json!("b"))),
            Inbound::Event(SessionEvent::RoundEnded {
                session_id: "s1".into(),
                turn_id: "t1".into(),
                round_id: "r1".into(),
            }),
            Inbound::Event(SessionEvent::TurnEnded {
                session_id: "s1".into(),
                turn_id: "t1".into(),
            }),
        ];
        for inbound in events {
            tx.send(inbound).await.unwrap();
        }
        drop(tx);
        rt.run(rx).await;

        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Completed);
        match &session.turns[0].model_rounds[0].items[0] {
            FlowItem::Text(text) => assert_eq!(text.content, "ab"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_run_loop() {
        let t = TestRuntime::new();
        let (_tx, rx) = t.runtime.inbox();
        t.runtime.shutdown();
        t.runtime.run(rx).await;
    }

    // ------------------------------------------------------------------------
    // Confirmation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_confirmed_tool_runs_to_completion() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;
        let rt = &t.runtime;

        rt.ingest(fragment("s1", "t1", "r1", "tool_call", tool_call("tool-1", true)))
            .await;
        let pending = rt.pending_confirmations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_name, "bash");
        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].model_rounds[0].status, RoundStatus::PendingConfirmation);

        rt.confirm_tool("tool-1", Some(json!({"command": "ls -la"})))
            .await
            .unwrap();
        assert_eq!(
            t.agent.recorded_calls(),
            vec![AgentCall::Resume {
                tool_id: "tool-1".into(),
                input: json!({"command": "ls -la"}),
            }]
        );
        assert!(matches!(
            rt.confirm_tool("tool-1", None).await,
            Err(ConfirmError::Gate(GateError::AlreadyResolved { .. }))
        ));

        rt.apply(SessionEvent::ToolStarted {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            round_id: "r1".into(),
            tool_id: "tool-1".into(),
        })
        .await
        .unwrap();
        assert_eq!(rt.context().gate.lock().await.state("tool-1"), Some(GateState::Running));

        rt.ingest(fragment("s1", "t1", "r1", "tool_result", json!({"id": "tool-1", "result": "ok"})))
            .await;
        assert_eq!(rt.context().gate.lock().await.state("tool-1"), Some(GateState::Completed));

        t.end_round("s1", "t1", "r1").await;
        t.end_turn("s1", "t1").await;

        let session = rt.get_session("s1").await.unwrap();
        let tool = session.turns[0].model_rounds[0].tool("tool-1").unwrap();
        assert_eq!(tool.status, ItemStatus::Completed);
        assert!(tool.user_confirmed);
        assert_eq!(tool.tool_call.input, json!({"command": "ls -la"}));
        assert_eq!(session.turns[0].status, TurnStatus::Completed);
        // finished turns release their gate entries
        assert_eq!(rt.context().gate.lock().await.state("tool-1"), None);
    }

    #[tokio::test]
    async fn test_reject_leaves_sibling_pending() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;
        let rt = &t.runtime;

        rt.ingest(fragment("s1", "t1", "r1", "tool_call", tool_call("tool-1", true)))
            .await;
        rt.ingest(fragment("s1", "t1", "r1", "tool_call", tool_call("tool-2", true)))
            .await;
        rt.reject_tool("tool-1").await.unwrap();

        let session = rt.get_session("s1").await.unwrap();
        let round = &session.turns[0].model_rounds[0];
        assert_eq!(round.tool("tool-1").unwrap().status, ItemStatus::Rejected);
        assert_eq!(round.tool("tool-2").unwrap().status, ItemStatus::PendingConfirmation);
        assert_eq!(round.status, RoundStatus::PendingConfirmation);
        assert_eq!(
            t.agent.recorded_calls(),
            vec![AgentCall::Skip {
                tool_id: "tool-1".into()
            }]
        );

        let pending = rt.pending_confirmations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_id, "tool-2");
    }

    #[tokio::test]
    async fn test_confirm_unknown_tool() {
        let t = TestRuntime::new();
        assert_eq!(
            t.runtime.confirm_tool("ghost", None).await,
            Err(ConfirmError::Gate(GateError::UnknownTool("ghost".into())))
        );
    }

    #[tokio::test]
    async fn test_confirm_after_turn_failed_releases_gate_entry() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;
        let rt = &t.runtime;
        rt.ingest(fragment("s1", "t1", "r1", "tool_call", tool_call("tool-1", true)))
            .await;

        // fail the turn behind the gate's back
        rt.context()
            .manager
            .write()
            .await
            .apply_event(SessionEvent::TurnFailed {
                session_id: "s1".into(),
                turn_id: "t1".into(),
                error: "agent crashed".into(),
            })
            .unwrap();

        assert!(matches!(
            rt.confirm_tool("tool-1", None).await,
            Err(ConfirmError::Apply(ApplyError::TurnClosed { .. }))
        ));
        assert!(rt.pending_confirmations().await.is_empty());
        assert_eq!(rt.context().gate.lock().await.state("tool-1"), None);
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_is_two_phase() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;
        let rt = &t.runtime;
        rt.ingest(fragment("s1", "t1", "r1", "text", json!("working")))
            .await;
        let token = rt.execution_token("t1").await.unwrap();

        rt.cancel_turn("s1", "t1").await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(
            t.agent.recorded_calls(),
            vec![AgentCall::Cancel { turn_id: "t1".into() }]
        );
        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Cancelling);

        // no new rounds once cancelling
        let late = rt
            .apply(SessionEvent::RoundStarted {
                session_id: "s1".into(),
                turn_id: "t1".into(),
                round_id: "r2".into(),
            })
            .await;
        assert!(matches!(late, Err(ApplyError::TurnClosed { .. })));

        rt.apply(SessionEvent::RoundCancelled {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            round_id: "r1".into(),
        })
        .await
        .unwrap();

        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Cancelled);
        assert_eq!(session.turns[0].model_rounds.len(), 1);
        assert_eq!(session.turns[0].model_rounds[0].items[0].status(), ItemStatus::Cancelled);
        assert_eq!(t.snapshots.wait_for_created(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_every_open_round() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;
        t.start_round("s1", "t1", "r2").await;
        let rt = &t.runtime;
        rt.ingest(fragment("s1", "t1", "r1", "text", json!("first")))
            .await;
        rt.ingest(fragment("s1", "t1", "r2", "text", json!("second")))
            .await;

        rt.cancel_turn("s1", "t1").await.unwrap();
        let ack = |round_id: &str| SessionEvent::RoundCancelled {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            round_id: round_id.into(),
        };

        rt.apply(ack("r1")).await.unwrap();
        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Cancelling);
        assert_eq!(session.turns[0].model_rounds[0].status, RoundStatus::Cancelled);
        assert_eq!(session.turns[0].model_rounds[1].status, RoundStatus::Streaming);

        rt.apply(ack("r2")).await.unwrap();
        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Cancelled);
        assert!(session.turns[0]
            .model_rounds
            .iter()
            .all(|round| round.status == RoundStatus::Cancelled));

        // a fragment after the acknowledgement is dropped
        rt.ingest(fragment("s1", "t1", "r2", "text", json!(" late")))
            .await;
        assert_eq!(rt.get_session("s1").await.unwrap(), session);
    }

    // ------------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_rollback_restores_truncates_and_notifies_in_order() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.complete_turn("s1", "t0").await;
        t.complete_turn("s1", "t1").await;
        t.start_turn("s1", "t2").await;
        let rt = &t.runtime;
        let open_token = rt.execution_token("t2").await.unwrap();

        t.snapshots
            .set_restore_result(Ok(vec!["src/a.rs".into(), "src/b.rs".into()]));
        let mut rx = rt.bus().subscribe();

        let outcome = rt.rollback_to_turn("s1", 0).await.unwrap();
        assert_eq!(
            outcome,
            RollbackOutcome::RolledBack {
                restored_files: vec!["src/a.rs".into(), "src/b.rs".into()],
                dropped_turns: 2,
            }
        );
        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].id, "t0");
        assert!(open_token.is_cancelled());

        assert_eq!(
            without_session_updates(drain(&mut rx)),
            vec![
                CoreEvent::FileTreeRefresh,
                CoreEvent::EditorFileChanged {
                    file_path: "src/a.rs".into()
                },
                CoreEvent::EditorFileChanged {
                    file_path: "src/b.rs".into()
                },
                CoreEvent::RollbackCompleted {
                    session_id: "s1".into(),
                    turn_index: 0,
                    restored_files: vec!["src/a.rs".into(), "src/b.rs".into()],
                },
            ]
        );

        // repeating is a no-op that reports the same files
        let again = rt.rollback_to_turn("s1", 0).await.unwrap();
        assert_eq!(again.restored_files(), ["src/a.rs".to_string(), "src/b.rs".to_string()]);
        assert!(matches!(again, RollbackOutcome::NoOp { .. }));
        assert_eq!(t.snapshots.restore_count(), 1);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(
            rt.rollback_to_turn("s1", 5).await,
            Err(RollbackError::UnknownTurn {
                session_id: "s1".into(),
                turn_index: 5,
            })
        );
    }

    #[tokio::test]
    async fn test_rollback_keeps_turns_through_index() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        for i in 0..5 {
            t.complete_turn("s1", &format!("t{i}")).await;
        }
        let rt = &t.runtime;
        let files: Vec<String> = vec!["a.rs".into(), "b.rs".into(), "c.rs".into()];
        t.snapshots.set_restore_result(Ok(files.clone()));
        let mut rx = rt.bus().subscribe();

        let outcome = rt.rollback_to_turn("s1", 2).await.unwrap();
        assert_eq!(
            outcome,
            RollbackOutcome::RolledBack {
                restored_files: files.clone(),
                dropped_turns: 2,
            }
        );
        let session = rt.get_session("s1").await.unwrap();
        let ids: Vec<&str> = session.turns.iter().map(|turn| turn.id.as_str()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2"]);

        let completed: Vec<CoreEvent> = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, CoreEvent::RollbackCompleted { .. }))
            .collect();
        assert_eq!(
            completed,
            vec![CoreEvent::RollbackCompleted {
                session_id: "s1".into(),
                turn_index: 2,
                restored_files: files,
            }]
        );
    }

    #[tokio::test]
    async fn test_partial_restore_keeps_turns_and_reports_files() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.complete_turn("s1", "t0").await;
        t.complete_turn("s1", "t1").await;
        let rt = &t.runtime;
        t.snapshots.set_restore_result(Err(CollaboratorError::Partial {
            message: "disk full".into(),
            completed: vec!["src/a.rs".into()],
        }));
        let mut rx = rt.bus().subscribe();

        let err = rt.rollback_to_turn("s1", 0).await.unwrap_err();
        match err {
            RollbackError::SnapshotRestoreFailed { restored_files, .. } => {
                assert_eq!(restored_files, vec!["src/a.rs".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(rt.get_session("s1").await.unwrap().turns.len(), 2);
        assert_eq!(
            drain(&mut rx),
            vec![CoreEvent::EditorFileChanged {
                file_path: "src/a.rs".into()
            }]
        );
    }

    // ------------------------------------------------------------------------
    // Dispatch and retry
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_without_workspace_model() {
        let t = TestRuntimeBuilder::new().without_model().build();
        let result = t.runtime.send_message("hi", &mut Vec::new(), None).await;
        assert!(matches!(result, Err(DispatchError::NoWorkspaceModel)));
        assert!(t.runtime.list_sessions().await.is_empty());
        assert!(t.upstream.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_uploads_images_and_clears_contexts() {
        let t = TestRuntime::new();
        let mut contexts = vec![
            ContextItem::File {
                id: "c0".into(),
                path: "src/lib.rs".into(),
                line_range: None,
            },
            ContextItem::Image {
                id: "c1".into(),
                name: "shot.png".into(),
                path: None,
                is_local: false,
                data: Some("data:image/png;base64,aGk=".into()),
                mime_type: None,
                image_id: None,
            },
        ];
        let receipt = t
            .runtime
            .send_message("what is this", &mut contexts, Some("debug"))
            .await
            .unwrap();
        assert!(contexts.is_empty());

        let uploads = t.uploader.recorded_uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].bytes, b"hi".to_vec());
        assert_eq!(uploads[0].mime_type.as_deref(), Some("image/png"));

        let sent = t.upstream.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].agent_type, "debug");
        assert_eq!(
            sent[0].model_body,
            "[File: src/lib.rs]\n[Clipboard Image: shot.png (image_id: img-c1)]\n\nwhat is this"
        );

        let session = t.runtime.get_session(&receipt.session_id).await.unwrap();
        let turn = &session.turns[0];
        assert_eq!(turn.user_message.content, "what is this");
        assert_eq!(turn.user_message.images[0].id, "img-c1");
        assert_eq!(turn.status, TurnStatus::ImageAnalyzing);
        assert_eq!(t.bootstrap.created()[0].agent_type, "debug");
    }

    #[tokio::test]
    async fn test_failed_upload_creates_no_turn() {
        let t = TestRuntime::new();
        t.uploader
            .fail_with(CollaboratorError::Unavailable("storage offline".into()));
        let mut contexts = vec![ContextItem::Image {
            id: "c1".into(),
            name: "shot.png".into(),
            path: None,
            is_local: false,
            data: Some("aGk=".into()),
            mime_type: Some("image/png".into()),
            image_id: None,
        }];

        let result = t.runtime.send_message("look", &mut contexts, None).await;
        assert!(matches!(result, Err(DispatchError::ImageUploadFailed(_))));
        assert_eq!(contexts.len(), 1);
        let sessions = t.runtime.list_sessions().await;
        assert!(sessions.iter().all(|session| session.turns.is_empty()));
        assert!(t.upstream.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_message_retries_then_fails_turn() {
        let t = TestRuntimeBuilder::new().with_max_retries(3).build();
        let rt = &t.runtime;
        t.upstream.queue_rejections(4);

        let mut contexts = vec![ContextItem::Directory {
            id: "d".into(),
            path: "src".into(),
        }];
        let Err(DispatchError::UpstreamRejected { message, .. }) =
            rt.send_message("hello", &mut contexts, None).await
        else {
            panic!("expected rejection");
        };
        // contexts survive a rejected send
        assert_eq!(contexts.len(), 1);
        let turn_id = message.local_turn_id.clone();
        let session_id = message.session_id.clone();

        let queued = rt.queue_for_retry(*message.clone()).await;
        assert_eq!(rt.queue_for_retry(*message).await.id, queued.id);

        assert_eq!(
            rt.retry_pending().await,
            vec![(turn_id.clone(), RetryAttempt::Requeued { retry_count: 1 })]
        );
        assert_eq!(
            rt.retry_pending().await,
            vec![(turn_id.clone(), RetryAttempt::Requeued { retry_count: 2 })]
        );
        assert_eq!(
            rt.retry_pending().await,
            vec![(turn_id.clone(), RetryAttempt::GaveUp { retry_count: 3 })]
        );
        assert!(rt.retry_pending().await.is_empty());

        let session = rt.get_session(&session_id).await.unwrap();
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].status, TurnStatus::Error);
        assert_eq!(rt.queued_messages().await[0].status, QueueStatus::Failed);
        // every replay reused the local turn id
        assert!(t
            .upstream
            .sent_messages()
            .iter()
            .all(|sent| sent.local_turn_id == turn_id));
        assert_eq!(t.upstream.sent_messages().len(), 4);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let t = TestRuntime::new();
        let rt = &t.runtime;
        t.upstream.queue_rejections(1);
        let Err(DispatchError::UpstreamRejected { message, .. }) =
            rt.send_message("hello", &mut Vec::new(), None).await
        else {
            panic!("expected rejection");
        };
        let turn_id = message.local_turn_id.clone();
        rt.queue_for_retry(*message).await;

        assert_eq!(rt.retry_pending().await, vec![(turn_id, RetryAttempt::Sent)]);
        // delivered entries are pruned
        assert!(rt.queued_messages().await.is_empty());
        let session = rt.list_sessions().await.remove(0);
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].status, TurnStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_after_rollback_never_recreates_turn() {
        let t = TestRuntime::new();
        let rt = &t.runtime;
        let first = rt.send_message("first", &mut Vec::new(), None).await.unwrap();
        t.upstream.queue_rejections(1);
        let Err(DispatchError::UpstreamRejected { message, .. }) =
            rt.send_message("second", &mut Vec::new(), None).await
        else {
            panic!("expected rejection");
        };
        let turn_id = message.local_turn_id.clone();
        rt.queue_for_retry(*message.clone()).await;

        rt.rollback_to_turn(&first.session_id, 0).await.unwrap();
        // the dropped turn's entry went with it
        assert!(rt.queued_messages().await.is_empty());
        assert!(rt.retry_pending().await.is_empty());

        // a stale entry queued afterwards is abandoned unsent
        rt.queue_for_retry(*message).await;
        assert_eq!(rt.retry_pending().await, vec![(turn_id, RetryAttempt::Abandoned)]);
        assert!(rt.queued_messages().await.is_empty());

        let session = rt.get_session(&first.session_id).await.unwrap();
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].id, first.turn_id);
        assert_eq!(t.upstream.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_after_cancel_sends_nothing() {
        let t = TestRuntime::new();
        let rt = &t.runtime;
        t.upstream.queue_rejections(1);
        let Err(DispatchError::UpstreamRejected { message, .. }) =
            rt.send_message("hello", &mut Vec::new(), None).await
        else {
            panic!("expected rejection");
        };
        let turn_id = message.local_turn_id.clone();
        let session_id = message.session_id.clone();
        rt.queue_for_retry(*message).await;

        rt.cancel_turn(&session_id, &turn_id).await.unwrap();
        let session = rt.get_session(&session_id).await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Cancelled);

        assert_eq!(
            rt.retry_pending().await,
            vec![(turn_id.clone(), RetryAttempt::Abandoned)]
        );
        assert_eq!(t.upstream.sent_messages().len(), 1);
        let queued = rt.queued_messages().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, QueueStatus::Failed);
        assert_eq!(queued[0].retry_count, 0);
        assert!(queued[0].last_error.as_deref().unwrap().contains("closed"));

        assert!(rt.retry_pending().await.is_empty());
        let session = rt.get_session(&session_id).await.unwrap();
        assert_eq!(session.turns[0].status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_delete_session_discards_its_queued_messages() {
        let t = TestRuntime::new();
        let rt = &t.runtime;
        t.upstream.queue_rejections(1);
        let Err(DispatchError::UpstreamRejected { message, .. }) =
            rt.send_message("hello", &mut Vec::new(), None).await
        else {
            panic!("expected rejection");
        };
        let session_id = message.session_id.clone();
        rt.queue_for_retry(*message).await;

        rt.delete_session(&session_id).await.unwrap();
        assert!(rt.queued_messages().await.is_empty());
        assert!(rt.retry_pending().await.is_empty());
        assert_eq!(t.upstream.sent_messages().len(), 1);
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_background_session_keeps_streaming_after_switch() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        t.create_session("s2").await;
        let rt = &t.runtime;
        rt.switch_session("s1").await.unwrap();
        t.start_turn("s1", "t1").await;
        t.start_round("s1", "t1", "r1").await;

        rt.switch_session("s2").await.unwrap();
        rt.ingest(fragment("s1", "t1", "r1", "text", json!("still here")))
            .await;
        rt.apply(SessionEvent::TurnFailed {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            error: "boom".into(),
        })
        .await
        .unwrap();

        assert_eq!(rt.session_status("s1").await, Some(SessionStatus::Error));
        assert_eq!(rt.session_status("s2").await, Some(SessionStatus::Active));
        let session = rt.get_session("s1").await.unwrap();
        assert_eq!(session.turns[0].model_rounds[0].items.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_active_session() {
        let t = TestRuntime::new();
        t.create_session("s1").await;
        let rt = &t.runtime;
        rt.switch_session("s1").await.unwrap();
        t.start_turn("s1", "t1").await;
        let token = rt.execution_token("t1").await.unwrap();
        let mut rx = rt.bus().subscribe();

        rt.delete_session("s1").await.unwrap();
        assert!(token.is_cancelled());
        assert!(rt.get_session("s1").await.is_none());
        assert_eq!(rt.active_session_id().await, None);
        assert_eq!(
            drain(&mut rx),
            vec![CoreEvent::ActiveSessionChanged { session_id: None }]
        );
    }
}
