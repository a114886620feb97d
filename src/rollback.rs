//! Turn snapshot rollback
//!
//! Restores the workspace to the state after a turn, then drops every later
//! turn and tells editors which files changed underneath them.

use crate::bus::CoreEvent;
use crate::runtime::{CollaboratorError, CoreContext, TurnSnapshot};
use crate::state_machine::{ApplyError, SessionEvent};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// The target already is the latest turn; nothing was restored.
    /// Carries the files of an earlier rollback to the same target.
    NoOp { restored_files: Vec<String> },
    RolledBack {
        restored_files: Vec<String>,
        dropped_turns: usize,
    },
}

impl RollbackOutcome {
    pub fn restored_files(&self) -> &[String] {
        match self {
            RollbackOutcome::NoOp { restored_files } | RollbackOutcome::RolledBack { restored_files, .. } => {
                restored_files
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RollbackError {
    #[error("Unknown session {0}")]
    UnknownSession(String),
    #[error("Session {session_id} has no turn {turn_index}")]
    UnknownTurn { session_id: String, turn_index: usize },
    /// Files in `restored_files` were already rewritten before the failure
    #[error("Snapshot restore failed for session {session_id} turn {turn_index}: {reason}")]
    SnapshotRestoreFailed {
        session_id: String,
        turn_index: usize,
        reason: String,
        restored_files: Vec<String>,
    },
}

pub struct RollbackCoordinator {
    ctx: CoreContext,
    /// Target and files of the last successful rollback per session
    last_restored: Mutex<HashMap<String, (usize, Vec<String>)>>,
}

impl RollbackCoordinator {
    pub fn new(ctx: CoreContext) -> Self {
        Self {
            ctx,
            last_restored: Mutex::new(HashMap::new()),
        }
    }

    /// Roll `session_id` back so `turn_index` is its latest turn.
    pub async fn rollback_to_turn(&self, session_id: &str, turn_index: usize) -> Result<RollbackOutcome, RollbackError> {
        let turn_count = self
            .ctx
            .manager
            .read()
            .await
            .turn_count(session_id)
            .ok_or_else(|| RollbackError::UnknownSession(session_id.to_string()))?;
        if turn_index >= turn_count {
            return Err(RollbackError::UnknownTurn {
                session_id: session_id.to_string(),
                turn_index,
            });
        }
        if turn_index + 1 == turn_count {
            tracing::debug!(session_id = %session_id, turn_index, "Rollback target is the latest turn");
            let restored_files = self
                .last_restored
                .lock()
                .await
                .get(session_id)
                .filter(|(target, _)| *target == turn_index)
                .map(|(_, files)| files.clone())
                .unwrap_or_default();
            return Ok(RollbackOutcome::NoOp { restored_files });
        }

        let restored_files = match self
            .ctx
            .collaborators
            .snapshots
            .restore_to_turn(session_id, turn_index)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                let restored_files = match &e {
                    CollaboratorError::Partial { completed, .. } => completed.clone(),
                    CollaboratorError::Rejected(_) | CollaboratorError::Unavailable(_) => Vec::new(),
                };
                // editors must not keep stale buffers for files already rewritten
                for file_path in &restored_files {
                    self.ctx.bus.publish(CoreEvent::EditorFileChanged {
                        file_path: file_path.clone(),
                    });
                }
                tracing::error!(session_id = %session_id, turn_index, error = %e, "Snapshot restore failed");
                return Err(RollbackError::SnapshotRestoreFailed {
                    session_id: session_id.to_string(),
                    turn_index,
                    reason: e.to_string(),
                    restored_files,
                });
            }
        };

        self.ctx
            .apply(SessionEvent::TurnsTruncated {
                session_id: session_id.to_string(),
                keep_through: turn_index,
            })
            .await
            .map_err(|e| match e {
                ApplyError::TurnIndexOutOfRange { .. } => RollbackError::UnknownTurn {
                    session_id: session_id.to_string(),
                    turn_index,
                },
                _ => RollbackError::UnknownSession(session_id.to_string()),
            })?;

        let bus = &self.ctx.bus;
        bus.publish(CoreEvent::FileTreeRefresh);
        for file_path in &restored_files {
            bus.publish(CoreEvent::EditorFileChanged {
                file_path: file_path.clone(),
            });
        }
        bus.publish(CoreEvent::RollbackCompleted {
            session_id: session_id.to_string(),
            turn_index,
            restored_files: restored_files.clone(),
        });

        tracing::info!(
            session_id = %session_id,
            turn_index,
            files = restored_files.len(),
            "Rollback completed"
        );
        self.last_restored
            .lock()
            .await
            .insert(session_id.to_string(), (turn_index, restored_files.clone()));
        Ok(RollbackOutcome::RolledBack {
            restored_files,
            dropped_turns: turn_count - turn_index - 1,
        })
    }

    pub async fn list_snapshots(&self, session_id: &str) -> Result<Vec<TurnSnapshot>, CollaboratorError> {
        self.ctx.collaborators.snapshots.list_snapshots(session_id).await
    }
}
