//! Distillation of provider requests and responses into span attributes.
//!
//! Both the plain-JSON and the SSE response paths funnel into [`Capture`]:
//! model, response text, token usage, declared tool uses, stop reason.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::pricing::TokenCounts;

/// Span attribute string limit; longer prompt/response text is truncated
/// with a visible marker and spilled verbatim to the run's `raw/` directory.
pub const MAX_ATTR_CHARS: usize = 10_000;

/// Payloads above this many bytes are written to `raw/<hash>.json`.
pub const SPILL_BYTES: usize = 10 * 1024;

/// Estimation rate when the provider omitted `input_tokens`: one token per
/// ~3.7 characters, lower-bounded by 0.75 tokens per word.
const CHARS_PER_TOKEN: f64 = 3.7;
const TOKENS_PER_WORD: f64 = 0.75;

/// Token usage as reported by the provider. All fields optional: streaming
/// responses reveal them incrementally across events.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
}

impl Usage {
    /// Merge a later usage update into this one. Later non-null values
    /// override earlier ones, with one exception: `input_tokens` is sticky —
    /// the value from `message_start` must survive partial updates that
    /// resend only output counts.
    pub fn merge(&mut self, later: &Usage) {
        if self.input_tokens.is_none() {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens.is_some() {
            self.output_tokens = later.output_tokens;
        }
        if later.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = later.cache_read_input_tokens;
        }
        if later.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = later.cache_creation_input_tokens;
        }
    }

    pub fn to_counts(self) -> TokenCounts {
        TokenCounts {
            input: self.input_tokens.unwrap_or(0),
            output: self.output_tokens.unwrap_or(0),
            cache_read: self.cache_read_input_tokens.unwrap_or(0),
            cache_write: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

/// A `tool_use` content block: the provider's declared intention to invoke a
/// named tool with structured input.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Everything extracted from one provider response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capture {
    pub model: Option<String>,
    pub text: String,
    pub usage: Usage,
    pub tool_uses: Vec<ToolUseBlock>,
    pub stop_reason: Option<String>,
}

// ===== Anthropic wire types (Messages API, non-streaming) =====

#[derive(Deserialize)]
struct MsgResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

impl Capture {
    /// Parse a non-streaming JSON response body.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        let resp: MsgResponse = serde_json::from_slice(body)?;
        let mut capture = Capture {
            model: resp.model,
            usage: resp.usage,
            stop_reason: resp.stop_reason,
            ..Default::default()
        };
        for block in &resp.content {
            capture.absorb_content_block(block);
        }
        Ok(capture)
    }

    /// Fold one content block (text or tool_use) into the capture. Unknown
    /// block types are ignored.
    pub(crate) fn absorb_content_block(&mut self, block: &Value) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    self.text.push_str(text);
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                if !id.is_empty() && !name.is_empty() {
                    self.tool_uses.push(ToolUseBlock {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
            }
            _ => {}
        }
    }
}

/// Join the human-readable prompt out of a request body: system prompt
/// first, then each message's text content.
pub fn prompt_from_request(body: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();
    match body.get("system") {
        Some(Value::String(s)) => parts.push(s.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
        }
        _ => {}
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("?");
            match message.get("content") {
                Some(Value::String(s)) => parts.push(format!("{role}: {s}")),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                parts.push(format!("{role}: {text}"));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    parts.join("\n")
}

/// Character-count token estimate for requests whose response did not report
/// `input_tokens`. Always positive for non-empty content.
pub fn estimate_input_tokens(request_text: &str) -> u64 {
    if request_text.is_empty() {
        return 0;
    }
    let by_chars = request_text.chars().count() as f64 / CHARS_PER_TOKEN;
    let by_words = request_text.split_whitespace().count() as f64 * TOKENS_PER_WORD;
    by_chars.max(by_words).ceil().max(1.0) as u64
}

/// Truncate to the attribute limit, appending a marker with the number of
/// characters dropped. Returns the (possibly shortened) text.
pub fn truncate_attr(text: &str) -> String {
    let total = text.chars().count();
    if total <= MAX_ATTR_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_ATTR_CHARS).collect();
    format!("{kept}… [truncated {} chars]", total - MAX_ATTR_CHARS)
}

/// Write an oversized payload verbatim to `raw/<hash>.json`, returning the
/// path. Content-addressed, so identical payloads dedupe naturally.
pub fn spill_raw(raw_dir: &Path, payload: &str) -> std::io::Result<PathBuf> {
    let digest = Sha256::digest(payload.as_bytes());
    let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    let path = raw_dir.join(format!("{hash}.json"));
    if !path.exists() {
        std::fs::write(&path, payload)?;
    }
    Ok(path)
}
