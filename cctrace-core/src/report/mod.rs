//! Report materialization: JSONL trace → self-contained HTML.
//!
//! The output embeds the span data as a JSON literal plus the pre-built
//! viewer bundle into a static template; no external fetches. Materializing
//! the same JSONL twice yields byte-identical HTML.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::error::{CcTraceError, CoreResult};
use crate::otlp::span::{decode_batch, Span};
use crate::otlp::{
    ATTR_AI_CACHE_READ, ATTR_AI_CACHE_WRITE, ATTR_AI_COST_USD, ATTR_AI_MODEL,
    ATTR_AI_TOKENS_INPUT, ATTR_AI_TOKENS_OUTPUT, ATTR_HOOK_EVENT, ATTR_TOOL_NAME,
};
use crate::run::{REPORT_FILE, TRACE_FILE};

const TEMPLATE: &str = include_str!("../../assets/report.html");
const VIEWER_BUNDLE: &str = include_str!("../../assets/viewer.js");

const DATA_PLACEHOLDER: &str = "/*__CCTRACE_DATA__*/null";
const VIEWER_PLACEHOLDER: &str = "/*__CCTRACE_VIEWER__*/";

/// Span id used for the synthetic session root when the trace has no single
/// root of its own.
const SYNTHETIC_ROOT_ID: &str = "0000000000000000";

/// Derived span classification. Not a wire-format field; computed from the
/// name prefix and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Api,
    Tool,
    Hook,
    File,
    Test,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Tool => "tool",
            Category::Hook => "hook",
            Category::File => "file",
            Category::Test => "test",
            Category::Other => "other",
        }
    }
}

pub fn categorize(span: &Span) -> Category {
    if span.attr(ATTR_AI_MODEL).is_some() || span.name.starts_with("API ") {
        return Category::Api;
    }
    if span.attr(ATTR_HOOK_EVENT).is_some() || span.name.starts_with("Hook:") {
        return Category::Hook;
    }
    if span.attr(ATTR_TOOL_NAME).is_some() || span.name.starts_with("Tool:") {
        return Category::Tool;
    }
    if span.name.starts_with("File") {
        return Category::File;
    }
    if span.name.starts_with("Test") {
        return Category::Test;
    }
    Category::Other
}

/// Read every parseable span out of the JSONL. Malformed lines (including a
/// final line truncated by a crash) are skipped with a warning.
pub fn read_spans(trace_file: &Path) -> Vec<Span> {
    let content = match std::fs::read_to_string(trace_file) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let mut spans = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode_batch(line) {
            Some(batch) => spans.extend(batch),
            None => warn!(
                "skipping malformed trace line {} in {}",
                idx + 1,
                trace_file.display()
            ),
        }
    }
    spans
}

/// Ensure the span set has exactly one root. Spans whose parent was never
/// observed count as roots; when there is more than one, a synthetic session
/// root spanning `[min(start), max(end)]` is prepended and the orphans are
/// reparented to it.
pub fn ensure_single_root(spans: &mut Vec<Span>) -> Option<String> {
    if spans.is_empty() {
        return None;
    }
    let known: std::collections::HashSet<String> =
        spans.iter().map(|s| s.span_id.clone()).collect();
    let root_ids: Vec<String> = spans
        .iter()
        .filter(|s| {
            s.parent_span_id
                .as_ref()
                .map_or(true, |p| !known.contains(p))
        })
        .map(|s| s.span_id.clone())
        .collect();

    if root_ids.len() == 1 {
        return Some(root_ids.into_iter().next().unwrap());
    }

    let start = spans.iter().map(|s| s.start_unix_nano).min().unwrap_or(0);
    let end = spans.iter().map(|s| s.end_unix_nano).max().unwrap_or(0);
    let trace_id = spans[0].trace_id.clone();
    for span in spans.iter_mut() {
        let orphan = span
            .parent_span_id
            .as_ref()
            .map_or(true, |p| !known.contains(p));
        if orphan {
            span.parent_span_id = Some(SYNTHETIC_ROOT_ID.to_string());
        }
    }
    spans.insert(
        0,
        Span {
            trace_id,
            span_id: SYNTHETIC_ROOT_ID.to_string(),
            parent_span_id: None,
            name: "Session".to_string(),
            kind: crate::otlp::SpanKind::Internal,
            start_unix_nano: start,
            end_unix_nano: end,
            attributes: Vec::new(),
            status: crate::otlp::SpanStatus::Unset,
        },
    );
    Some(SYNTHETIC_ROOT_ID.to_string())
}

/// Aggregate metrics shown in the report header.
pub fn summarize(spans: &[Span], root_id: Option<&str>) -> Value {
    let mut counts = std::collections::BTreeMap::new();
    for cat in ["api", "tool", "hook", "file", "test", "other"] {
        counts.insert(cat.to_string(), 0u64);
    }
    let mut tokens_in = 0i64;
    let mut tokens_out = 0i64;
    let mut cache_read = 0i64;
    let mut cache_write = 0i64;
    let mut cost = 0.0f64;

    for span in spans {
        if span.span_id == SYNTHETIC_ROOT_ID {
            continue;
        }
        let category = categorize(span);
        *counts.entry(category.as_str().to_string()).or_insert(0) += 1;
        if category == Category::Api {
            let get = |key: &str| span.attr(key).and_then(|v| v.as_i64()).unwrap_or(0);
            tokens_in += get(ATTR_AI_TOKENS_INPUT);
            tokens_out += get(ATTR_AI_TOKENS_OUTPUT);
            cache_read += get(ATTR_AI_CACHE_READ);
            cache_write += get(ATTR_AI_CACHE_WRITE);
            cost += span
                .attr(ATTR_AI_COST_USD)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
        }
    }

    let duration_ms = root_id
        .and_then(|id| spans.iter().find(|s| s.span_id == id))
        .map(|root| root.end_unix_nano.saturating_sub(root.start_unix_nano) / 1_000_000)
        .unwrap_or(0);

    json!({
        "spanCount": spans.len(),
        "counts": counts,
        "tokens": {
            "input": tokens_in,
            "output": tokens_out,
            "cacheRead": cache_read,
            "cacheWrite": cache_write,
        },
        "costUsd": cost,
        "durationMs": duration_ms,
    })
}

/// Escape a serialized JSON document for inlining inside a `<script>` tag:
/// `<`, `>`, `&` plus the JS line separators U+2028/U+2029. The characters
/// only occur inside JSON strings, where `\uXXXX` escapes are valid.
pub fn escape_for_script(serialized: &str) -> String {
    let mut out = String::with_capacity(serialized.len());
    for ch in serialized.chars() {
        match ch {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

/// Render the report HTML for a span set.
pub fn render_html(mut spans: Vec<Span>) -> String {
    let root_id = ensure_single_root(&mut spans);
    let summary = summarize(&spans, root_id.as_deref());
    let enriched: Vec<Value> = spans
        .iter()
        .map(|s| {
            let mut v = s.to_otlp_json();
            v["category"] = json!(categorize(s).as_str());
            v
        })
        .collect();
    let data = json!({
        "spans": enriched,
        "summary": summary,
        "rootSpanId": root_id,
    });
    let literal = escape_for_script(&data.to_string());
    TEMPLATE
        .replace(DATA_PLACEHOLDER, &literal)
        .replace(VIEWER_PLACEHOLDER, VIEWER_BUNDLE)
}

/// Read the run's JSONL and write `report.html` next to it. A missing or
/// empty trace file still produces a valid empty-state report.
pub fn materialize(run_dir: &Path) -> CoreResult<PathBuf> {
    let spans = read_spans(&run_dir.join(TRACE_FILE));
    let html = render_html(spans);
    let path = run_dir.join(REPORT_FILE);
    std::fs::write(&path, html).map_err(|e| CcTraceError::Writer {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}
