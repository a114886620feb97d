//! Dialog turns: one user message and everything produced in response

use super::item::{ImageAnalysisItem, ItemStatus};
use super::round::{ModelRound, RoundStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    ImageAnalyzing,
    Processing,
    Completed,
    Cancelling,
    Cancelled,
    Error,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Completed | TurnStatus::Cancelled | TurnStatus::Error
        )
    }
}

/// An image attached to the user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub id: String,
    pub name: String,
}

/// The message that opened the turn. Immutable once the turn exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    /// Display body: exactly what the user typed
    pub content: String,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            content: content.into(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysisPhase {
    pub items: Vec<ImageAnalysisItem>,
}

impl ImageAnalysisPhase {
    pub fn is_finished(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }
}

/// Outcome reported for one analysed image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageAnalysisOutcome {
    Described { description: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogTurn {
    pub id: String,
    pub session_id: String,
    pub user_message: UserMessage,
    pub image_analysis_phase: Option<ImageAnalysisPhase>,
    pub model_rounds: Vec<ModelRound>,
    pub status: TurnStatus,
    /// Turn-end received from the stream
    pub end_requested: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DialogTurn {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, user_message: UserMessage) -> Self {
        let image_analysis_phase = (!user_message.images.is_empty()).then(|| ImageAnalysisPhase {
            items: user_message
                .images
                .iter()
                .map(|image| ImageAnalysisItem::analyzing(&image.id))
                .collect(),
        });
        let status = if image_analysis_phase.is_some() {
            TurnStatus::ImageAnalyzing
        } else {
            TurnStatus::Pending
        };
        Self {
            id: id.into(),
            session_id: session_id.into(),
            user_message,
            image_analysis_phase,
            model_rounds: Vec::new(),
            status,
            end_requested: false,
            start_time: Utc::now(),
            end_time: None,
            token_usage: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn round(&self, round_id: &str) -> Option<&ModelRound> {
        self.model_rounds.iter().find(|round| round.id == round_id)
    }

    pub fn round_mut(&mut self, round_id: &str) -> Option<&mut ModelRound> {
        self.model_rounds.iter_mut().find(|round| round.id == round_id)
    }

    /// Open a round with the next index and move to processing.
    pub fn open_round(&mut self, round_id: impl Into<String>) -> &mut ModelRound {
        let index = self.model_rounds.len();
        self.model_rounds.push(ModelRound::new(round_id, index));
        if matches!(self.status, TurnStatus::Pending | TurnStatus::ImageAnalyzing) {
            self.status = TurnStatus::Processing;
        }
        let last = self.model_rounds.len() - 1;
        &mut self.model_rounds[last]
    }

    /// Record the outcome for one image. Returns false for unknown images.
    pub fn record_image_analysis(&mut self, image_id: &str, outcome: ImageAnalysisOutcome) -> bool {
        let Some(phase) = self.image_analysis_phase.as_mut() else {
            return false;
        };
        let Some(item) = phase.items.iter_mut().find(|item| item.image_id == image_id) else {
            return false;
        };
        match outcome {
            ImageAnalysisOutcome::Described { description } => {
                item.status = ItemStatus::Completed;
                item.result = Some(description);
            }
            ImageAnalysisOutcome::Failed { error } => {
                item.status = ItemStatus::Error;
                item.error = Some(error);
            }
        }
        if phase.is_finished() && self.status == TurnStatus::ImageAnalyzing {
            self.status = TurnStatus::Pending;
        }
        true
    }

    /// Recompute status after a round changed.
    ///
    /// The final status is the status of the last round, so a round that
    /// errored and was followed by a successful one does not fail the turn.
    /// Returns true when the turn just became terminal.
    pub fn reevaluate(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let all_rounds_terminal = self.model_rounds.iter().all(ModelRound::is_terminal);
        if self.status == TurnStatus::Cancelling {
            if all_rounds_terminal {
                self.finish(TurnStatus::Cancelled);
                return true;
            }
            return false;
        }
        if !self.end_requested || !all_rounds_terminal {
            return false;
        }
        let status = match self.model_rounds.last().map(|round| round.status) {
            Some(RoundStatus::Error) => TurnStatus::Error,
            Some(RoundStatus::Cancelled) => TurnStatus::Cancelled,
            _ => TurnStatus::Completed,
        };
        if status == TurnStatus::Error && self.error.is_none() {
            self.error = self.model_rounds.last().and_then(|round| round.error.clone());
        }
        self.finish(status);
        true
    }

    /// Turn-end from the stream
    pub fn end(&mut self) -> bool {
        self.end_requested = true;
        self.reevaluate()
    }

    /// First phase of cancellation: mark `cancelling` right away.
    ///
    /// Returns true when nothing was open and the turn is already cancelled.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_terminal() || self.status == TurnStatus::Cancelling {
            return false;
        }
        if let Some(phase) = self.image_analysis_phase.as_mut() {
            for item in &mut phase.items {
                if !item.status.is_terminal() {
                    item.status = ItemStatus::Cancelled;
                }
            }
        }
        self.status = TurnStatus::Cancelling;
        self.reevaluate()
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let error = error.into();
        for round in &mut self.model_rounds {
            round.fail(error.clone());
        }
        self.error = Some(error);
        self.finish(TurnStatus::Error);
        true
    }

    fn finish(&mut self, status: TurnStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}
