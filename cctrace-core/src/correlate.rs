//! Tool-use correlation.
//!
//! API responses declare tool-use intentions (`tool_use` content blocks with
//! provider-assigned ids). Tool executions surface later as PostToolUse hook
//! events in a *different* OS process, so intentions are mirrored to a
//! sidecar JSONL next to the trace file: the wrapper records them, the hook
//! orchestrator hydrates its store from the sidecar before matching.
//!
//! Matching is best-effort: tool name equality plus structural equality of
//! the tool input over a canonical JSON form, newest intention first.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::otlp::span::now_unix_nano;

/// In-memory bound; oldest intentions are evicted first.
const MAX_PENDING: usize = 256;
/// Only the most recent intentions participate in matching.
const MATCH_WINDOW: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingToolUse {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Canonical-JSON rendering of the declared tool input.
    pub tool_input: String,
    pub observed_at_unix_nano: u64,
}

pub struct ToolUseStore {
    pending: Mutex<VecDeque<PendingToolUse>>,
    sidecar: Option<PathBuf>,
}

impl ToolUseStore {
    /// Store backed by the run's sidecar file.
    pub fn new(sidecar: PathBuf) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            sidecar: Some(sidecar),
        }
    }

    /// Purely in-memory store (tests, or callers without a run directory).
    pub fn in_memory() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            sidecar: None,
        }
    }

    /// Record a declared intention. Sidecar write failures are logged and
    /// ignored: correlation degrades to unmatched execution spans, never to
    /// an error on the capture path.
    pub fn record(&self, tool_use_id: &str, tool_name: &str, tool_input: &Value) {
        let entry = PendingToolUse {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input: canonical_json(tool_input),
            observed_at_unix_nano: now_unix_nano(),
        };
        if let Some(path) = &self.sidecar {
            if let Err(e) = append_sidecar(path, &entry) {
                warn!(path = %path.display(), "tool-use sidecar write failed: {e}");
            }
        }
        let mut pending = self.pending.lock().unwrap();
        pending.push_back(entry);
        while pending.len() > MAX_PENDING {
            pending.pop_front();
        }
    }

    /// Match an executed tool call back to its intention. The most recent
    /// intention with equal name and canonical input wins and is consumed —
    /// providers repeat identical calls, and most-recent-first reflects the
    /// host's single-threaded execution order.
    pub fn resolve(&self, tool_name: &str, tool_input: &Value) -> Option<String> {
        let wanted = canonical_json(tool_input);
        let mut pending = self.pending.lock().unwrap();
        let len = pending.len();
        let newest_first = (0..len).rev().take(MATCH_WINDOW);
        for idx in newest_first {
            let entry = &pending[idx];
            if entry.tool_name == tool_name && entry.tool_input == wanted {
                let id = entry.tool_use_id.clone();
                pending.remove(idx);
                return Some(id);
            }
        }
        None
    }

    /// Hydrate the in-memory queue from the sidecar (cross-process path:
    /// intentions were recorded by the wrapper, matching happens in the
    /// orchestrator). Malformed lines are skipped.
    pub fn load_sidecar(run_sidecar: &Path) -> Self {
        let store = Self::new(run_sidecar.to_path_buf());
        if let Ok(content) = std::fs::read_to_string(run_sidecar) {
            let mut pending = store.pending.lock().unwrap();
            for line in content.lines() {
                match serde_json::from_str::<PendingToolUse>(line) {
                    Ok(entry) => {
                        pending.push_back(entry);
                        while pending.len() > MAX_PENDING {
                            pending.pop_front();
                        }
                    }
                    Err(_) => continue,
                }
            }
        }
        store
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn append_sidecar(path: &Path, entry: &PendingToolUse) -> std::io::Result<()> {
    let mut line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// Render a JSON value with object keys sorted and no insignificant
/// whitespace, so structurally equal inputs compare equal as strings.
/// Array order is significant and preserved.
pub fn canonical_json(value: &Value) -> String {
    fn write_value(out: &mut String, value: &Value) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string key"));
                    out.push(':');
                    write_value(out, &map[*key]);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(out, item);
                }
                out.push(']');
            }
            leaf => out.push_str(&serde_json::to_string(leaf).expect("json leaf")),
        }
    }
    let mut out = String::new();
    write_value(&mut out, value);
    out
}
