//! Context items attached to a user message and their model-body expansion

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Something the user attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    File {
        id: String,
        path: String,
        #[serde(default)]
        line_range: Option<(u32, u32)>,
    },
    Directory {
        id: String,
        path: String,
    },
    CodeSnippet {
        id: String,
        path: String,
        start_line: u32,
        end_line: u32,
        #[serde(default)]
        language: Option<String>,
        code: String,
    },
    Image {
        id: String,
        name: String,
        /// Workspace path for local images
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        is_local: bool,
        /// Inline payload, base64 with or without a data-URL prefix
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        /// Set once the payload is uploaded
        #[serde(default)]
        image_id: Option<String>,
    },
    Url {
        id: String,
        url: String,
        #[serde(default)]
        title: Option<String>,
    },
}

impl ContextItem {
    pub fn id(&self) -> &str {
        match self {
            ContextItem::File { id, .. }
            | ContextItem::Directory { id, .. }
            | ContextItem::CodeSnippet { id, .. }
            | ContextItem::Image { id, .. }
            | ContextItem::Url { id, .. } => id,
        }
    }

    /// Non-local image with an inline payload that still has to be uploaded
    pub fn needs_upload(&self) -> bool {
        matches!(
            self,
            ContextItem::Image { is_local: false, data: Some(_), image_id: None, .. }
        )
    }

    /// Text line(s) this item contributes to the model body
    pub fn expand(&self) -> String {
        match self {
            ContextItem::File { path, line_range: None, .. } => format!("[File: {path}]"),
            ContextItem::File {
                path,
                line_range: Some((start, end)),
                ..
            } => format!("[File: {path} (lines {start}-{end})]"),
            ContextItem::Directory { path, .. } => format!("[Directory: {path}]"),
            ContextItem::CodeSnippet {
                path,
                start_line,
                end_line,
                language,
                code,
                ..
            } => format!(
                "[Code Snippet: {path} (lines {start_line}-{end_line})]\n```{}\n{code}\n```",
                language.as_deref().unwrap_or_default()
            ),
            ContextItem::Image {
                name,
                image_id: Some(image_id),
                ..
            } => format!("[Clipboard Image: {name} (image_id: {image_id})]"),
            ContextItem::Image { path: Some(path), .. } => format!("[Image: {path}]"),
            ContextItem::Image { name, .. } => format!("[Image: {name}]"),
            ContextItem::Url { url, title: Some(title), .. } => format!("[URL: {title} ({url})]"),
            ContextItem::Url { url, .. } => format!("[URL: {url}]"),
        }
    }
}

/// Body sent upstream: one expansion per context, a blank line, then the
/// user text. Without contexts it is the text unchanged.
pub fn build_model_body(text: &str, contexts: &[ContextItem]) -> String {
    if contexts.is_empty() {
        return text.to_string();
    }
    let expansions: Vec<String> = contexts.iter().map(ContextItem::expand).collect();
    format!("{}\n\n{text}", expansions.join("\n"))
}

/// Decode an inline image payload, tolerating a `data:<mime>;base64,` prefix.
///
/// Returns the mime type found in the prefix, if any.
pub fn decode_inline_image(data: &str) -> Result<(Option<String>, Vec<u8>), base64::DecodeError> {
    let (mime, encoded) = match data.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((header, encoded)) => {
            let mime = header
                .split(';')
                .next()
                .filter(|mime| !mime.is_empty())
                .map(str::to_string);
            (mime, encoded)
        }
        None => (None, data),
    };
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok((mime, bytes))
}
