//! Server-sent-event response parsing.
//!
//! Contract:
//! - Only `data:` lines carry payloads; `event:` lines, comments, and blank
//!   separators are ignored, as is the `[DONE]` terminator.
//! - Text accumulates from `content_block_delta` events; tool-use inputs
//!   accumulate from `input_json_delta` partials per content-block index.
//! - `usage` merges across events with later non-null values overriding,
//!   except `input_tokens`, which is sticky once observed (the value from
//!   `message_start` survives `message_delta` updates).

use std::collections::HashMap;

use serde_json::Value;

use super::capture::{Capture, ToolUseBlock, Usage};

/// Whether a response content-type indicates an SSE stream.
pub fn is_sse(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|t| t.eq_ignore_ascii_case("text/event-stream"))
}

/// In-flight tool_use block: declared id/name plus accumulated partial JSON.
struct PartialToolUse {
    id: String,
    name: String,
    start_input: Value,
    partial_json: String,
}

/// Parse a complete SSE body into a [`Capture`]. Malformed events are
/// skipped; whatever parsed cleanly is kept.
pub fn parse_sse(body: &str) -> Capture {
    let mut capture = Capture::default();
    let mut blocks: HashMap<u64, PartialToolUse> = HashMap::new();

    for line in body.lines() {
        let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    capture.model = Some(model.to_string());
                }
                merge_usage(&mut capture.usage, message.get("usage"));
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let Some(block) = event.get("content_block") else {
                    continue;
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            capture.text.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        blocks.insert(
                            index,
                            PartialToolUse {
                                id: block
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                start_input: block
                                    .get("input")
                                    .cloned()
                                    .unwrap_or(Value::Null),
                                partial_json: String::new(),
                            },
                        );
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let Some(delta) = event.get("delta") else {
                    continue;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            capture.text.push_str(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) =
                            delta.get("partial_json").and_then(Value::as_str)
                        {
                            if let Some(block) = blocks.get_mut(&index) {
                                block.partial_json.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = blocks.remove(&index) {
                    finalize_tool_use(&mut capture, block);
                }
            }
            Some("message_delta") => {
                if let Some(stop) = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    capture.stop_reason = Some(stop.to_string());
                }
                merge_usage(&mut capture.usage, event.get("usage"));
            }
            _ => {}
        }
    }

    // A truncated stream may never deliver content_block_stop; keep whatever
    // tool blocks were declared, in index order.
    let mut leftovers: Vec<(u64, PartialToolUse)> = blocks.into_iter().collect();
    leftovers.sort_by_key(|(index, _)| *index);
    for (_, block) in leftovers {
        finalize_tool_use(&mut capture, block);
    }
    capture
}

fn finalize_tool_use(capture: &mut Capture, block: PartialToolUse) {
    if block.id.is_empty() || block.name.is_empty() {
        return;
    }
    let input = if block.partial_json.is_empty() {
        block.start_input
    } else {
        serde_json::from_str(&block.partial_json).unwrap_or(Value::Null)
    };
    capture.tool_uses.push(ToolUseBlock {
        id: block.id,
        name: block.name,
        input,
    });
}

fn merge_usage(usage: &mut Usage, update: Option<&Value>) {
    let Some(update) = update else { return };
    if let Ok(parsed) = serde_json::from_value::<Usage>(update.clone()) {
        usage.merge(&parsed);
    }
}
