//! Chunk parser: raw stream fragments into typed chunks

use crate::flow::{TextKind, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A fragment as delivered by the stream source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFragment {
    pub session_id: String,
    pub turn_id: String,
    pub round_id: String,
    /// `text`, `thinking`, `tool_call` or `tool_result`; inferred when absent
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl StreamFragment {
    pub fn new(
        session_id: impl Into<String>,
        turn_id: impl Into<String>,
        round_id: impl Into<String>,
        kind: &str,
        payload: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            turn_id: turn_id.into(),
            round_id: round_id.into(),
            kind: Some(kind.to_string()),
            payload,
        }
    }
}

/// Classified fragment content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParsedChunk {
    Text {
        kind: TextKind,
        content: String,
        /// Closes the open item after appending
        end: bool,
    },
    ToolCall {
        id: String,
        tool: Option<String>,
        params_delta: Option<String>,
        /// Whole input delivered at once
        input: Option<Value>,
        is_final: bool,
        requires_confirmation: bool,
    },
    ToolResult {
        id: String,
        result: ToolResult,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Malformed {kind} fragment: {reason}")]
    MalformedFragment { kind: String, reason: String },
}

impl ParseError {
    fn malformed(kind: &str, reason: impl Into<String>) -> Self {
        ParseError::MalformedFragment {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TextPayload {
    #[serde(alias = "content", alias = "delta", alias = "thinking")]
    text: String,
    #[serde(default, alias = "is_end", alias = "done")]
    end: bool,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    #[serde(alias = "tool_id")]
    id: String,
    #[serde(default, alias = "name", alias = "tool_name")]
    tool: Option<String>,
    #[serde(default, alias = "delta", alias = "partial_json")]
    params_delta: Option<String>,
    #[serde(default, alias = "params")]
    input: Option<Value>,
    #[serde(default, alias = "done", alias = "is_end")]
    is_final: bool,
    #[serde(default)]
    requires_confirmation: bool,
}

#[derive(Debug, Deserialize)]
struct ToolResultPayload {
    #[serde(alias = "tool_id")]
    id: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

/// Classify one fragment.
pub fn parse_fragment(fragment: &StreamFragment) -> Result<ParsedChunk, ParseError> {
    let kind = match fragment.kind.as_deref() {
        Some(kind) => kind.to_string(),
        None => infer_kind(&fragment.payload)
            .ok_or_else(|| ParseError::malformed("unknown", "cannot infer fragment kind"))?
            .to_string(),
    };

    match kind.as_str() {
        "text" => parse_text(&kind, TextKind::Text, &fragment.payload),
        "thinking" => parse_text(&kind, TextKind::Thinking, &fragment.payload),
        "tool_call" => {
            let payload: ToolCallPayload = decode(&kind, &fragment.payload)?;
            if payload.id.is_empty() {
                return Err(ParseError::malformed(&kind, "empty tool call id"));
            }
            if let Some(input) = &payload.input {
                if !input.is_object() {
                    return Err(ParseError::malformed(&kind, "tool input is not an object"));
                }
            }
            Ok(ParsedChunk::ToolCall {
                id: payload.id,
                tool: payload.tool.filter(|name| !name.is_empty()),
                params_delta: payload.params_delta,
                is_final: payload.is_final || payload.input.is_some(),
                input: payload.input,
                requires_confirmation: payload.requires_confirmation,
            })
        }
        "tool_result" => {
            let payload: ToolResultPayload = decode(&kind, &fragment.payload)?;
            if payload.id.is_empty() {
                return Err(ParseError::malformed(&kind, "empty tool call id"));
            }
            let success = payload.success.unwrap_or(payload.error.is_none());
            Ok(ParsedChunk::ToolResult {
                id: payload.id,
                result: ToolResult {
                    success,
                    result: payload.result,
                    error: payload.error,
                    duration_ms: payload.duration_ms,
                },
            })
        }
        other => Err(ParseError::malformed(other, "unknown fragment kind")),
    }
}

fn parse_text(kind: &str, text_kind: TextKind, payload: &Value) -> Result<ParsedChunk, ParseError> {
    if let Value::String(content) = payload {
        return Ok(ParsedChunk::Text {
            kind: text_kind,
            content: content.clone(),
            end: false,
        });
    }
    let payload: TextPayload = decode(kind, payload)?;
    Ok(ParsedChunk::Text {
        kind: text_kind,
        content: payload.text,
        end: payload.end,
    })
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: &Value) -> Result<T, ParseError> {
    serde_json::from_value(payload.clone()).map_err(|e| ParseError::malformed(kind, e.to_string()))
}

fn infer_kind(payload: &Value) -> Option<&'static str> {
    match payload {
        Value::String(_) => Some("text"),
        Value::Object(map) => {
            if map.contains_key("result") || map.contains_key("success") {
                Some("tool_result")
            } else if map.contains_key("tool") || map.contains_key("params_delta") || map.contains_key("input") {
                Some("tool_call")
            } else if map.contains_key("thinking") {
                Some("thinking")
            } else if map.contains_key("text") {
                Some("text")
            } else {
                None
            }
        }
        _ => None,
    }
}
