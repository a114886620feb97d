//! Flow item builder: applies parsed chunks to a model round

use super::parser::ParsedChunk;
use crate::flow::{FlowItem, ItemStatus, ModelRound, TextItem, TextKind, ToolItem, ToolResult};
use serde_json::Value;
use thiserror::Error;

/// What a chunk did to the round
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Content was appended or an item was created
    Applied,
    /// A tool finished streaming its parameters and waits for the user
    AwaitingConfirmation { tool_id: String, input: Value },
    /// A tool received its result
    ToolFinished { tool_id: String, is_error: bool },
}

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("Tool {0} not found in round")]
    UnknownTool(String),
    #[error("Tool {tool_id} cannot take a result while {status}")]
    ResultRejected { tool_id: String, status: String },
}

/// Apply one chunk to `round` and recompute the round status.
pub fn apply_chunk(round: &mut ModelRound, chunk: ParsedChunk) -> Result<ChunkOutcome, BuildError> {
    let outcome = match chunk {
        ParsedChunk::Text { kind, content, end } => {
            append_text(round, kind, &content, end);
            ChunkOutcome::Applied
        }
        ParsedChunk::ToolCall {
            id,
            tool,
            params_delta,
            input,
            is_final,
            requires_confirmation,
        } => apply_tool_call(
            round,
            &id,
            tool,
            params_delta.as_deref(),
            input,
            is_final,
            requires_confirmation,
        ),
        ParsedChunk::ToolResult { id, result } => apply_tool_result(round, &id, result)?,
    };
    round.reevaluate();
    Ok(outcome)
}

fn append_text(round: &mut ModelRound, kind: TextKind, content: &str, end: bool) {
    if let Some(item) = round.open_text_mut(kind).and_then(FlowItem::as_text_mut) {
        item.content.push_str(content);
        if end {
            item.close();
        }
        return;
    }
    if content.is_empty() && end {
        // close marker with nothing open
        return;
    }
    let mut item = TextItem::new(content);
    if end {
        item.close();
    }
    round.push_item(match kind {
        TextKind::Text => FlowItem::Text(item),
        TextKind::Thinking => FlowItem::Thinking(item),
    });
}

fn apply_tool_call(
    round: &mut ModelRound,
    id: &str,
    tool: Option<String>,
    params_delta: Option<&str>,
    input: Option<Value>,
    is_final: bool,
    requires_confirmation: bool,
) -> ChunkOutcome {
    if round.tool(id).is_none() {
        let name = tool.clone().unwrap_or_default();
        round.push_item(FlowItem::Tool(ToolItem::streaming(id, name, requires_confirmation)));
    }
    let Some(item) = round.tool_mut(id) else {
        return ChunkOutcome::Applied;
    };
    if let Some(name) = tool {
        if item.tool_call.name.is_empty() {
            item.tool_call.name = name;
        }
    }
    if requires_confirmation && item.is_params_streaming {
        item.requires_confirmation = true;
    }
    if let Some(delta) = params_delta {
        item.push_params(delta);
    }
    if !is_final || !item.is_params_streaming {
        return ChunkOutcome::Applied;
    }
    item.finish_params(input);
    if item.status == ItemStatus::PendingConfirmation {
        return ChunkOutcome::AwaitingConfirmation {
            tool_id: item.id.clone(),
            input: item.tool_call.input.clone(),
        };
    }
    ChunkOutcome::Applied
}

fn apply_tool_result(round: &mut ModelRound, id: &str, result: ToolResult) -> Result<ChunkOutcome, BuildError> {
    let item = round
        .tool_mut(id)
        .ok_or_else(|| BuildError::UnknownTool(id.to_string()))?;
    if !item.accepts_result() {
        return Err(BuildError::ResultRejected {
            tool_id: id.to_string(),
            status: format!("{:?}", item.status),
        });
    }
    item.complete(result);
    Ok(ChunkOutcome::ToolFinished {
        tool_id: id.to_string(),
        is_error: item.status == ItemStatus::Error,
    })
}
