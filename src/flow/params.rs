//! Incremental tool-parameter accumulation
//!
//! Tool call arguments arrive as raw JSON text split at arbitrary points.
//! The buffer keeps the concatenated text and, after every delta, attempts a
//! best-effort parse so the UI can show parameters while they stream in.

use serde_json::Value;

/// Parse state of a [`ParamsBuffer`]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ParamsState {
    /// Nothing received yet
    #[default]
    Empty,
    /// Deltas received, final fragment not yet seen
    Accumulating,
    /// Final fragment applied and the whole buffer parsed
    Parsed(Value),
    /// Final fragment applied but the buffer is not valid JSON
    Failed(String),
}

/// Accumulates streamed JSON text for one tool call.
#[derive(Debug, Clone, Default)]
pub struct ParamsBuffer {
    buffer: String,
    state: ParamsState,
    last_partial: Option<Value>,
    last_partial_ok: bool,
}

impl ParamsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and refresh the partial view.
    ///
    /// Returns the last-known-good partial value, which is left untouched
    /// when the new text cannot be completed into valid JSON.
    pub fn push(&mut self, delta: &str) -> Option<&Value> {
        if self.is_finished() {
            tracing::debug!("Ignoring params delta after final fragment");
            return self.last_partial.as_ref();
        }
        self.buffer.push_str(delta);
        self.state = ParamsState::Accumulating;

        match complete_partial_json(&self.buffer) {
            Some(value) => {
                self.last_partial = Some(value);
                self.last_partial_ok = true;
            }
            None => self.last_partial_ok = false,
        }
        self.last_partial.as_ref()
    }

    /// Parse the whole buffer as the final input.
    ///
    /// An empty buffer is an empty object: tools without arguments stream
    /// no argument text at all.
    pub fn finish(&mut self) -> &ParamsState {
        if self.is_finished() {
            return &self.state;
        }
        let text = self.buffer.trim();
        let parsed = if text.is_empty() {
            Ok(Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_str::<Value>(text)
        };
        self.state = match parsed {
            Ok(value) => {
                self.last_partial = Some(value.clone());
                self.last_partial_ok = true;
                ParamsState::Parsed(value)
            }
            Err(e) => {
                self.last_partial_ok = false;
                ParamsState::Failed(e.to_string())
            }
        };
        &self.state
    }

    pub fn state(&self) -> &ParamsState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ParamsState::Parsed(_) | ParamsState::Failed(_))
    }

    /// Whether the most recent parse attempt produced a value
    pub fn last_parse_succeeded(&self) -> bool {
        self.last_partial_ok
    }

    pub fn last_partial(&self) -> Option<&Value> {
        self.last_partial.as_ref()
    }
}

/// Close an incomplete JSON document so it parses.
///
/// First closes any open string and brackets as-is. If that still fails
/// (a dangling key, colon or literal), truncates back to the last point
/// where the document was structurally complete and closes from there.
pub fn complete_partial_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // (byte offset to cut at, open brackets at that point)
    let mut last_safe: Option<(usize, Vec<char>)> = None;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => {
                stack.push(c);
                last_safe = Some((i + c.len_utf8(), stack.clone()));
            }
            '}' | ']' => {
                stack.pop();
                last_safe = Some((i + c.len_utf8(), stack.clone()));
            }
            ',' => last_safe = Some((i, stack.clone())),
            _ => {}
        }
    }

    let mut closed = text.to_string();
    if in_string {
        if escaped {
            closed.pop();
        }
        closed.push('"');
    }
    closed.push_str(&closing_brackets(&stack));
    if let Ok(value) = serde_json::from_str::<Value>(&closed) {
        return Some(value);
    }

    let (cut, open) = last_safe?;
    let mut truncated = text.get(..cut)?.to_string();
    truncated.push_str(&closing_brackets(&open));
    serde_json::from_str::<Value>(&truncated).ok()
}

fn closing_brackets(stack: &[char]) -> String {
    stack
        .iter()
        .rev()
        .map(|c| if *c == '{' { '}' } else { ']' })
        .collect()
}
