//! Event application for one session
//!
//! Pure with respect to I/O: applies one event to the session tree and
//! returns the effects the runtime must carry out afterwards.

use super::{Effect, SessionEvent};
use crate::flow::{DialogTurn, FlowItem, ItemStatus, ModelRound, RoundStatus, Session, TurnStatus};
use crate::stream::{apply_chunk, BuildError, ChunkOutcome};
use thiserror::Error;

/// Result of applying an event
#[derive(Debug, Default)]
pub struct TransitionResult {
    pub effects: Vec<Effect>,
    /// False when the event was an idempotent replay
    pub changed: bool,
    /// The addressed turn became terminal as a direct result
    pub turn_finished: bool,
}

impl TransitionResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    #[must_use]
    pub fn finished(mut self, finished: bool) -> Self {
        self.turn_finished = finished;
        self
    }
}

/// Reasons an event is dropped. None of them poison the session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApplyError {
    #[error("Unknown session {0}")]
    UnknownSession(String),
    #[error("Session {0} already exists")]
    DuplicateSession(String),
    #[error("Unknown turn {turn_id} in session {session_id}")]
    UnknownTurn { session_id: String, turn_id: String },
    #[error("Turn index {turn_index} out of range for session {session_id} ({turn_count} turns)")]
    TurnIndexOutOfRange {
        session_id: String,
        turn_index: usize,
        turn_count: usize,
    },
    #[error("Unknown round {round_id} in turn {turn_id}")]
    UnknownRound { turn_id: String, round_id: String },
    #[error("Unknown tool {0}")]
    UnknownTool(String),
    #[error("Turn {turn_id} is closed ({status:?})")]
    TurnClosed { turn_id: String, status: TurnStatus },
    #[error("Round {round_id} is closed ({status:?})")]
    RoundClosed { round_id: String, status: RoundStatus },
    #[error("Invalid transition for tool {tool_id}: {reason}")]
    InvalidToolTransition { tool_id: String, reason: String },
}

impl From<BuildError> for ApplyError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::UnknownTool(tool_id) => ApplyError::UnknownTool(tool_id),
            BuildError::ResultRejected { tool_id, status } => ApplyError::InvalidToolTransition {
                tool_id,
                reason: format!("result arrived while {status}"),
            },
        }
    }
}

/// Apply `event` to `session`.
#[allow(clippy::too_many_lines)] // one arm per event
pub fn transition(session: &mut Session, event: SessionEvent) -> Result<TransitionResult, ApplyError> {
    let session_id = session.session_id.clone();
    let addressed_turn = event.turn_id().map(str::to_string);

    let mut result = match event {
        SessionEvent::SessionCreated { session_id, .. } => {
            return Err(ApplyError::DuplicateSession(session_id));
        }

        // ============================================================
        // Turn lifecycle
        // ============================================================
        SessionEvent::TurnStarted {
            turn_id, user_message, ..
        } => {
            if session.turn(&turn_id).is_some() {
                tracing::debug!(session_id = %session_id, turn_id = %turn_id, "Turn already exists, ignoring");
                TransitionResult::unchanged()
            } else {
                session
                    .turns
                    .push(DialogTurn::new(turn_id, session_id.clone(), user_message));
                TransitionResult::changed()
            }
        }

        SessionEvent::ImageAnalysisCompleted {
            turn_id,
            image_id,
            outcome,
            ..
        } => {
            let turn = open_turn(session, &turn_id)?;
            if turn.record_image_analysis(&image_id, outcome) {
                TransitionResult::changed()
            } else {
                tracing::warn!(turn_id = %turn_id, image_id = %image_id, "Analysis for unknown image, ignoring");
                TransitionResult::unchanged()
            }
        }

        SessionEvent::TurnEnded { turn_id, .. } => {
            let turn = open_turn(session, &turn_id)?;
            if turn.end_requested {
                TransitionResult::unchanged()
            } else {
                let finished = turn.end();
                TransitionResult::changed().finished(finished)
            }
        }

        SessionEvent::TurnFailed { turn_id, error, .. } => {
            let turn = open_turn(session, &turn_id)?;
            tracing::warn!(session_id = %session_id, turn_id = %turn_id, error = %error, "Turn failed");
            let finished = turn.fail(error);
            TransitionResult::changed().finished(finished)
        }

        SessionEvent::CancelRequested { turn_id, .. } => {
            let turn = open_turn(session, &turn_id)?;
            if turn.status == TurnStatus::Cancelling {
                TransitionResult::unchanged()
            } else {
                let finished = turn.request_cancel();
                TransitionResult::changed()
                    .with_effect(Effect::CancelExecution {
                        session_id: session_id.clone(),
                        turn_id,
                    })
                    .finished(finished)
            }
        }

        SessionEvent::TokenUsage { turn_id, usage, .. } => {
            // usage may trail the turn end
            let turn = session.turn_mut(&turn_id).ok_or_else(|| ApplyError::UnknownTurn {
                session_id: session_id.clone(),
                turn_id: turn_id.clone(),
            })?;
            turn.token_usage = Some(usage);
            session.current_token_usage = usage.total_tokens;
            TransitionResult::changed()
        }

        // ============================================================
        // Round lifecycle
        // ============================================================
        SessionEvent::RoundStarted { turn_id, round_id, .. } => {
            let turn = open_turn(session, &turn_id)?;
            if turn.status == TurnStatus::Cancelling {
                return Err(ApplyError::TurnClosed {
                    turn_id,
                    status: turn.status,
                });
            }
            if turn.round(&round_id).is_some() {
                TransitionResult::unchanged()
            } else {
                turn.open_round(round_id);
                TransitionResult::changed()
            }
        }

        SessionEvent::Chunk {
            turn_id,
            round_id,
            chunk,
            ..
        } => {
            let turn = open_turn(session, &turn_id)?;
            let round = open_round(turn, &round_id)?;
            let mut result = TransitionResult::changed();
            if let ChunkOutcome::AwaitingConfirmation { tool_id, input } = apply_chunk(round, chunk)? {
                let tool_name = round
                    .tool(&tool_id)
                    .map(|tool| tool.tool_call.name.clone())
                    .unwrap_or_default();
                result = result.with_effect(Effect::AwaitConfirmation {
                    session_id: session_id.clone(),
                    turn_id,
                    round_id,
                    tool_id,
                    tool_name,
                    input,
                });
            }
            result
        }

        SessionEvent::RoundEnded { turn_id, round_id, .. } => {
            let round = open_round(open_turn(session, &turn_id)?, &round_id)?;
            round.end();
            TransitionResult::changed()
        }

        SessionEvent::RoundFailed {
            turn_id,
            round_id,
            error,
            ..
        } => {
            let round = open_round(open_turn(session, &turn_id)?, &round_id)?;
            tracing::warn!(turn_id = %turn_id, round_id = %round_id, error = %error, "Round failed");
            round.fail(error);
            TransitionResult::changed()
        }

        SessionEvent::RoundCancelled { turn_id, round_id, .. } => {
            let round = open_round(open_turn(session, &turn_id)?, &round_id)?;
            round.cancel();
            TransitionResult::changed()
        }

        // ============================================================
        // Tool confirmation
        // ============================================================
        SessionEvent::ToolConfirmed {
            turn_id,
            round_id,
            tool_id,
            updated_input,
            ..
        } => {
            let round = open_round(open_turn(session, &turn_id)?, &round_id)?;
            let tool = pending_tool(round, &tool_id)?;
            tool.confirm(updated_input);
            let input = tool.tool_call.input.clone();
            round.reevaluate();
            TransitionResult::changed().with_effect(Effect::ResumeTool {
                session_id: session_id.clone(),
                turn_id,
                tool_id,
                input,
            })
        }

        SessionEvent::ToolRejected {
            turn_id,
            round_id,
            tool_id,
            ..
        } => {
            let round = open_round(open_turn(session, &turn_id)?, &round_id)?;
            pending_tool(round, &tool_id)?.reject();
            round.reevaluate();
            TransitionResult::changed().with_effect(Effect::SkipTool {
                session_id: session_id.clone(),
                turn_id,
                tool_id,
            })
        }

        SessionEvent::ToolStarted {
            turn_id,
            round_id,
            tool_id,
            ..
        } => {
            let round = open_round(open_turn(session, &turn_id)?, &round_id)?;
            let tool = round
                .tool_mut(&tool_id)
                .ok_or_else(|| ApplyError::UnknownTool(tool_id.clone()))?;
            match tool.status {
                ItemStatus::Running => TransitionResult::unchanged(),
                ItemStatus::Confirmed => {
                    tool.start();
                    round.reevaluate();
                    TransitionResult::changed()
                }
                status => {
                    return Err(ApplyError::InvalidToolTransition {
                        tool_id,
                        reason: format!("cannot start from {status:?}"),
                    })
                }
            }
        }

        // ============================================================
        // Rollback
        // ============================================================
        SessionEvent::TurnsTruncated { keep_through, .. } => {
            let turn_count = session.turns.len();
            if keep_through >= turn_count {
                return Err(ApplyError::TurnIndexOutOfRange {
                    session_id,
                    turn_index: keep_through,
                    turn_count,
                });
            }
            let released: Vec<Effect> = session.turns[keep_through + 1..]
                .iter()
                .map(|turn| release_turn(&session_id, turn))
                .collect();
            if released.is_empty() {
                TransitionResult::unchanged()
            } else {
                let dropped = session.truncate_after(keep_through);
                tracing::info!(session_id = %session_id, keep_through, dropped = dropped.len(), "Turns truncated");
                TransitionResult::changed().with_effects(released)
            }
        }
    };

    if let Some(turn_id) = addressed_turn.filter(|_| result.changed) {
        settle(session, &turn_id, &mut result);
    }
    Ok(result)
}

/// Recompute the addressed turn and emit its completion effects once.
fn settle(session: &mut Session, turn_id: &str, result: &mut TransitionResult) {
    let Some(index) = session.turn_index(turn_id) else {
        return;
    };
    session.last_touched_turn_id = Some(turn_id.to_string());
    let turn = &mut session.turns[index];
    let finished = turn.reevaluate() || result.turn_finished;
    if !finished {
        return;
    }
    result.turn_finished = true;
    tracing::info!(
        session_id = %session.session_id,
        turn_id = %turn_id,
        status = ?turn.status,
        "Turn finished"
    );
    let release = release_turn(&session.session_id, turn);
    result.effects.push(Effect::RequestSnapshot {
        session_id: session.session_id.clone(),
        turn_index: index,
    });
    result.effects.push(release);
}

fn release_turn(session_id: &str, turn: &DialogTurn) -> Effect {
    Effect::ReleaseTurn {
        session_id: session_id.to_string(),
        turn_id: turn.id.clone(),
        tool_ids: turn
            .model_rounds
            .iter()
            .flat_map(|round| round.items.iter().filter_map(FlowItem::as_tool))
            .map(|tool| tool.id.clone())
            .collect(),
    }
}

fn open_turn<'a>(session: &'a mut Session, turn_id: &str) -> Result<&'a mut DialogTurn, ApplyError> {
    let session_id = session.session_id.clone();
    let turn = session.turn_mut(turn_id).ok_or_else(|| ApplyError::UnknownTurn {
        session_id,
        turn_id: turn_id.to_string(),
    })?;
    if turn.is_terminal() {
        return Err(ApplyError::TurnClosed {
            turn_id: turn_id.to_string(),
            status: turn.status,
        });
    }
    Ok(turn)
}

fn open_round<'a>(turn: &'a mut DialogTurn, round_id: &str) -> Result<&'a mut ModelRound, ApplyError> {
    let turn_id = turn.id.clone();
    let round = turn.round_mut(round_id).ok_or_else(|| ApplyError::UnknownRound {
        turn_id,
        round_id: round_id.to_string(),
    })?;
    if round.is_terminal() {
        return Err(ApplyError::RoundClosed {
            round_id: round_id.to_string(),
            status: round.status,
        });
    }
    Ok(round)
}

fn pending_tool<'a>(round: &'a mut ModelRound, tool_id: &str) -> Result<&'a mut crate::flow::ToolItem, ApplyError> {
    let tool = round
        .tool_mut(tool_id)
        .ok_or_else(|| ApplyError::UnknownTool(tool_id.to_string()))?;
    if tool.status != ItemStatus::PendingConfirmation {
        return Err(ApplyError::InvalidToolTransition {
            tool_id: tool_id.to_string(),
            reason: format!("not awaiting confirmation ({:?})", tool.status),
        });
    }
    Ok(tool)
}
