//! Retry queue for messages the backend did not accept
//!
//! Holds prepared messages and hands them out one attempt at a time. Replays
//! reuse the message's local turn id, so a retried message never creates a
//! second turn.

use crate::dispatcher::OutgoingMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub id: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub local_dialog_turn_id: String,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub message: OutgoingMessage,
}

/// What happened after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in the queue for another attempt
    Requeued { retry_count: u32 },
    /// Out of attempts; the turn should be marked as failed
    GaveUp { retry_count: u32 },
}

#[derive(Debug)]
pub struct RetryQueue {
    entries: Vec<QueuedMessage>,
    max_retries: u32,
}

impl RetryQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: Vec::new(),
            max_retries,
        }
    }

    /// Queue a message. A message whose local turn is already queued
    /// returns the existing entry unchanged.
    pub fn enqueue(&mut self, message: OutgoingMessage) -> &QueuedMessage {
        let index = match self.position(&message.local_turn_id) {
            Some(index) => index,
            None => {
                tracing::info!(
                    session_id = %message.session_id,
                    turn_id = %message.local_turn_id,
                    "Message queued for retry"
                );
                self.entries.push(QueuedMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    status: QueueStatus::Queued,
                    retry_count: 0,
                    local_dialog_turn_id: message.local_turn_id.clone(),
                    last_error: None,
                    enqueued_at: Utc::now(),
                    message,
                });
                self.entries.len() - 1
            }
        };
        &self.entries[index]
    }

    /// Take every queued message for an attempt, oldest first.
    pub fn take_ready(&mut self) -> Vec<OutgoingMessage> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.status == QueueStatus::Queued)
            .map(|entry| {
                entry.status = QueueStatus::Processing;
                entry.message.clone()
            })
            .collect()
    }

    pub fn mark_succeeded(&mut self, local_turn_id: &str) {
        if let Some(entry) = self.processing_entry(local_turn_id) {
            entry.status = QueueStatus::Completed;
            entry.last_error = None;
        }
    }

    /// Record a failed attempt. Returns `None` if the message was not in
    /// flight.
    pub fn mark_failed(&mut self, local_turn_id: &str, error: impl Into<String>) -> Option<RetryDecision> {
        let max_retries = self.max_retries;
        let entry = self.processing_entry(local_turn_id)?;
        entry.retry_count += 1;
        entry.last_error = Some(error.into());
        if entry.retry_count >= max_retries {
            entry.status = QueueStatus::Failed;
            tracing::warn!(
                turn_id = %local_turn_id,
                retry_count = entry.retry_count,
                "Giving up on queued message"
            );
            Some(RetryDecision::GaveUp {
                retry_count: entry.retry_count,
            })
        } else {
            entry.status = QueueStatus::Queued;
            Some(RetryDecision::Requeued {
                retry_count: entry.retry_count,
            })
        }
    }

    /// Stop retrying a message whose turn can no longer take it.
    pub fn mark_abandoned(&mut self, local_turn_id: &str, reason: impl Into<String>) {
        if let Some(entry) = self.processing_entry(local_turn_id) {
            entry.status = QueueStatus::Failed;
            entry.last_error = Some(reason.into());
        }
    }

    /// Drop the entry for a turn that no longer exists
    pub fn discard(&mut self, local_turn_id: &str) -> Option<QueuedMessage> {
        let index = self.position(local_turn_id)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, local_turn_id: &str) -> Option<&QueuedMessage> {
        self.position(local_turn_id).map(|index| &self.entries[index])
    }

    pub fn entries(&self) -> &[QueuedMessage] {
        &self.entries
    }

    /// Drop completed entries; failed ones stay visible.
    pub fn prune_completed(&mut self) {
        self.entries.retain(|entry| entry.status != QueueStatus::Completed);
    }

    fn position(&self, local_turn_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.local_dialog_turn_id == local_turn_id)
    }

    fn processing_entry(&mut self, local_turn_id: &str) -> Option<&mut QueuedMessage> {
        self.entries
            .iter_mut()
            .find(|entry| entry.local_dialog_turn_id == local_turn_id && entry.status == QueueStatus::Processing)
    }
}
