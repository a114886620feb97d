//! Flow items: the smallest streamed units of a model round

use super::params::{ParamsBuffer, ParamsState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status shared by every flow item kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Streaming,
    Analyzing,
    PendingConfirmation,
    Confirmed,
    Running,
    Completed,
    Cancelled,
    Error,
    Rejected,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Cancelled | ItemStatus::Error | ItemStatus::Rejected
        )
    }
}

/// Which text-like item a chunk targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Text,
    Thinking,
}

/// Streaming text or thinking content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub id: String,
    pub content: String,
    pub is_streaming: bool,
    pub status: ItemStatus,
    pub timestamp: DateTime<Utc>,
}

impl TextItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            is_streaming: true,
            status: ItemStatus::Streaming,
            timestamp: Utc::now(),
        }
    }

    pub fn close(&mut self) {
        if self.is_streaming {
            self.is_streaming = false;
            self.status = ItemStatus::Completed;
        }
    }
}

/// The tool invocation echoed back from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Outcome of a tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolResult {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
            duration_ms: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(message.into()),
            duration_ms: None,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.success || self.error.is_some()
    }
}

/// A tool call and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolItem {
    pub id: String,
    pub tool_call: ToolCall,
    tool_result: Option<ToolResult>,
    pub status: ItemStatus,
    pub requires_confirmation: bool,
    pub user_confirmed: bool,
    pub is_params_streaming: bool,
    pub partial_params: Option<Value>,
    /// Whether the latest parse of the streamed params produced a value
    #[serde(default = "parsed_by_default")]
    pub params_parse_ok: bool,
    #[serde(skip)]
    params: ParamsBuffer,
    pub timestamp: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

fn parsed_by_default() -> bool {
    true
}

impl PartialEq for ToolItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.tool_call == other.tool_call
            && self.tool_result == other.tool_result
            && self.status == other.status
            && self.requires_confirmation == other.requires_confirmation
            && self.user_confirmed == other.user_confirmed
            && self.is_params_streaming == other.is_params_streaming
            && self.partial_params == other.partial_params
            && self.params_parse_ok == other.params_parse_ok
    }
}

impl ToolItem {
    /// A tool whose parameters are about to stream in
    pub fn streaming(id: impl Into<String>, name: impl Into<String>, requires_confirmation: bool) -> Self {
        let id = id.into();
        Self {
            tool_call: ToolCall {
                id: id.clone(),
                name: name.into(),
                input: Value::Object(serde_json::Map::new()),
            },
            id,
            tool_result: None,
            status: ItemStatus::Streaming,
            requires_confirmation,
            user_confirmed: false,
            is_params_streaming: true,
            partial_params: None,
            params_parse_ok: true,
            params: ParamsBuffer::new(),
            timestamp: Utc::now(),
            end_time: None,
        }
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        self.tool_result.as_ref()
    }

    pub fn params_state(&self) -> &ParamsState {
        self.params.state()
    }

    /// Feed one argument delta while parameters are streaming.
    pub fn push_params(&mut self, delta: &str) {
        if !self.is_params_streaming {
            tracing::debug!(tool_id = %self.id, "Params delta after params closed, ignoring");
            return;
        }
        if let Some(partial) = self.params.push(delta) {
            self.partial_params = Some(partial.clone());
        }
        self.params_parse_ok = self.params.last_parse_succeeded();
    }

    /// Close parameter streaming and fix the final input.
    ///
    /// `input` wins over the buffer when the source delivered the whole
    /// object at once. A buffer that does not parse keeps the last partial
    /// value so the tool still shows what the model produced.
    pub fn finish_params(&mut self, input: Option<Value>) {
        if !self.is_params_streaming {
            return;
        }
        let streamed = input.is_none();
        let final_input = match input {
            Some(value) => value,
            None => match self.params.finish() {
                ParamsState::Parsed(value) => value.clone(),
                ParamsState::Failed(error) => {
                    tracing::warn!(
                        tool_id = %self.id,
                        error = %error,
                        "Tool params did not parse, keeping last partial value"
                    );
                    self.partial_params
                        .clone()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
                }
                ParamsState::Empty | ParamsState::Accumulating => {
                    Value::Object(serde_json::Map::new())
                }
            },
        };
        self.tool_call.input = final_input;
        self.params_parse_ok = !streamed || self.params.last_parse_succeeded();
        self.is_params_streaming = false;
        self.status = if self.requires_confirmation {
            ItemStatus::PendingConfirmation
        } else {
            ItemStatus::Running
        };
    }

    /// Whether a tool result may be attached in the current status
    pub fn accepts_result(&self) -> bool {
        matches!(
            self.status,
            ItemStatus::Streaming | ItemStatus::Running | ItemStatus::Confirmed
        )
    }

    /// Attach the result, moving to a terminal status first.
    pub fn complete(&mut self, result: ToolResult) {
        self.is_params_streaming = false;
        self.status = if result.is_error() {
            ItemStatus::Error
        } else {
            ItemStatus::Completed
        };
        self.end_time = Some(Utc::now());
        self.tool_result = Some(result);
    }

    pub fn confirm(&mut self, updated_input: Option<Value>) {
        if let Some(input) = updated_input {
            self.tool_call.input = input;
        }
        self.user_confirmed = true;
        self.status = ItemStatus::Confirmed;
    }

    pub fn reject(&mut self) {
        self.user_confirmed = false;
        self.status = ItemStatus::Rejected;
        self.end_time = Some(Utc::now());
    }

    pub fn start(&mut self) {
        self.status = ItemStatus::Running;
    }

    /// Move a non-terminal tool to `status` without a result.
    pub fn abort(&mut self, status: ItemStatus) {
        if !self.status.is_terminal() {
            self.is_params_streaming = false;
            self.status = status;
            self.end_time = Some(Utc::now());
        }
    }
}

/// One image being described before the model sees the message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysisItem {
    pub id: String,
    pub image_id: String,
    pub status: ItemStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ImageAnalysisItem {
    pub fn analyzing(image_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            image_id: image_id.into(),
            status: ItemStatus::Analyzing,
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// A flow item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowItem {
    Text(TextItem),
    Thinking(TextItem),
    Tool(ToolItem),
    ImageAnalysis(ImageAnalysisItem),
}

impl FlowItem {
    pub fn id(&self) -> &str {
        match self {
            FlowItem::Text(item) | FlowItem::Thinking(item) => &item.id,
            FlowItem::Tool(item) => &item.id,
            FlowItem::ImageAnalysis(item) => &item.id,
        }
    }

    pub fn status(&self) -> ItemStatus {
        match self {
            FlowItem::Text(item) | FlowItem::Thinking(item) => item.status,
            FlowItem::Tool(item) => item.status,
            FlowItem::ImageAnalysis(item) => item.status,
        }
    }

    pub fn text_kind(&self) -> Option<TextKind> {
        match self {
            FlowItem::Text(_) => Some(TextKind::Text),
            FlowItem::Thinking(_) => Some(TextKind::Thinking),
            FlowItem::Tool(_) | FlowItem::ImageAnalysis(_) => None,
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut TextItem> {
        match self {
            FlowItem::Text(item) | FlowItem::Thinking(item) => Some(item),
            FlowItem::Tool(_) | FlowItem::ImageAnalysis(_) => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolItem> {
        match self {
            FlowItem::Tool(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_tool_mut(&mut self) -> Option<&mut ToolItem> {
        match self {
            FlowItem::Tool(item) => Some(item),
            _ => None,
        }
    }

    /// Move an open item to `status`; finished items are left alone.
    pub fn abort(&mut self, status: ItemStatus) {
        match self {
            FlowItem::Text(item) | FlowItem::Thinking(item) => {
                if !item.status.is_terminal() {
                    item.is_streaming = false;
                    item.status = status;
                }
            }
            FlowItem::Tool(item) => item.abort(status),
            FlowItem::ImageAnalysis(item) => {
                if !item.status.is_terminal() {
                    item.status = status;
                }
            }
        }
    }
}
