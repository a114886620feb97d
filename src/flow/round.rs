//! Model rounds: one inference pass worth of flow items

use super::item::{FlowItem, ItemStatus, TextKind, ToolItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Round status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Streaming,
    PendingConfirmation,
    Completed,
    Cancelled,
    Error,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RoundStatus::Completed | RoundStatus::Cancelled | RoundStatus::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRound {
    pub id: String,
    pub index: usize,
    pub items: Vec<FlowItem>,
    pub status: RoundStatus,
    /// Round-end received from the stream
    pub end_requested: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelRound {
    pub fn new(id: impl Into<String>, index: usize) -> Self {
        Self {
            id: id.into(),
            index,
            items: Vec::new(),
            status: RoundStatus::Streaming,
            end_requested: false,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The text item of `kind` still open at the end of the round, if any
    pub fn open_text_mut(&mut self, kind: TextKind) -> Option<&mut FlowItem> {
        self.items
            .last_mut()
            .filter(|item| item.text_kind() == Some(kind))
            .filter(|item| item.status() == ItemStatus::Streaming)
    }

    /// Append an item, closing open text of any other kind.
    ///
    /// A different item arriving means the model moved on, so earlier text
    /// stops streaming even without an explicit close.
    pub fn push_item(&mut self, item: FlowItem) {
        let kind = item.text_kind();
        for existing in &mut self.items {
            if existing.text_kind().is_some() && existing.text_kind() != kind {
                if let Some(text) = existing.as_text_mut() {
                    text.close();
                }
            }
        }
        self.items.push(item);
    }

    pub fn close_text(&mut self, kind: Option<TextKind>) {
        for item in &mut self.items {
            if kind.is_none() || item.text_kind() == kind {
                if let Some(text) = item.as_text_mut() {
                    text.close();
                }
            }
        }
    }

    pub fn tool(&self, tool_id: &str) -> Option<&ToolItem> {
        self.items
            .iter()
            .filter_map(FlowItem::as_tool)
            .find(|tool| tool.id == tool_id)
    }

    pub fn tool_mut(&mut self, tool_id: &str) -> Option<&mut ToolItem> {
        self.items
            .iter_mut()
            .filter_map(FlowItem::as_tool_mut)
            .find(|tool| tool.id == tool_id)
    }

    pub fn has_pending_confirmation(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.status() == ItemStatus::PendingConfirmation)
    }

    fn has_unfinished_tools(&self) -> bool {
        self.items
            .iter()
            .filter_map(FlowItem::as_tool)
            .any(|tool| !tool.status.is_terminal())
    }

    /// Recompute status after any item change.
    ///
    /// Returns true when the round just became terminal.
    pub fn reevaluate(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self.has_pending_confirmation() {
            self.status = RoundStatus::PendingConfirmation;
            return false;
        }
        if self.end_requested && !self.has_unfinished_tools() {
            self.close_text(None);
            self.status = RoundStatus::Completed;
            self.end_time = Some(Utc::now());
            return true;
        }
        self.status = RoundStatus::Streaming;
        false
    }

    /// Round-end from the stream
    pub fn end(&mut self) -> bool {
        self.end_requested = true;
        self.close_text(None);
        self.reevaluate()
    }

    /// Open items become cancelled, finished ones are untouched.
    pub fn cancel(&mut self) -> bool {
        self.terminate(RoundStatus::Cancelled, ItemStatus::Cancelled, None)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.terminate(RoundStatus::Error, ItemStatus::Error, Some(error.into()))
    }

    fn terminate(&mut self, status: RoundStatus, item_status: ItemStatus, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        for item in &mut self.items {
            item.abort(item_status);
        }
        self.status = status;
        self.error = error;
        self.end_time = Some(Utc::now());
        true
    }
}
