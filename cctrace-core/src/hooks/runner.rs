//! User-hook execution and response merging.
//!
//! Commands run strictly serially in discovery order — precedence matters
//! for blocking decisions. The orchestrator imposes no timeout of its own;
//! the host owns hook timeouts.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::event::HookEvent;
use crate::correlate::ToolUseStore;
use crate::otlp::{
    ATTR_HOOK_DURATION_MS, ATTR_HOOK_ERROR, ATTR_HOOK_EXIT_CODE, ATTR_HOOK_STDERR_LENGTH,
    ATTR_HOOK_STDOUT_LENGTH, ATTR_TOOL_DURATION_MS, ATTR_TOOL_OUTPUT, ATTR_TOOL_USE_ID,
};
use crate::otlp::SpanStatus;
use crate::tracer::Tracer;

/// Outcome of one user-hook command.
#[derive(Debug)]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr_len: usize,
    pub duration_ms: u64,
    pub spawn_error: Option<String>,
}

impl ExecResult {
    pub fn failed(&self) -> bool {
        self.exit_code != 0 || self.spawn_error.is_some()
    }

    fn response(&self) -> Option<Value> {
        serde_json::from_str(self.stdout.trim()).ok()
    }
}

/// Composite outcome the orchestrator writes to its own stdout.
#[derive(Debug)]
pub struct HookOutcome {
    /// JSON object handed back to the host.
    pub response: Value,
    /// Exact bytes for the orchestrator's stdout. For a blocking hook this
    /// is that hook's stdout verbatim, not a reserialization.
    pub stdout_payload: String,
    /// A hook returned `{"continue": false, …}`; its response was taken
    /// verbatim and later hooks were skipped.
    pub blocked: bool,
    pub results: Vec<ExecResult>,
}

impl HookOutcome {
    pub fn any_failed(&self) -> bool {
        self.results.iter().any(ExecResult::failed)
    }

    /// Worst user-hook exit code, 0 when everything succeeded.
    pub fn worst_exit_code(&self) -> i32 {
        self.results
            .iter()
            .map(|r| r.exit_code)
            .find(|&c| c != 0)
            .unwrap_or(0)
    }
}

/// Execute the discovered commands, emitting one hook-execution child span
/// per command under `event_span_id`, and merge their JSON responses.
///
/// Merge policy, first-wins: the first `{"continue": false}` response is
/// returned verbatim and stops execution (the host's blocking contract);
/// otherwise the first non-empty value for each of `stopReason`,
/// `decision`+`reason`, and `suppressOutput` folds into a composite
/// starting from `{"continue": true}`.
pub async fn run_hooks(
    tracer: &Arc<Tracer>,
    event_span_id: &str,
    event_json: &str,
    commands: &[String],
) -> HookOutcome {
    let mut results: Vec<ExecResult> = Vec::new();

    for command in commands {
        let span = tracer.start_hook_exec_span(command, event_span_id);
        let result = exec_one(command, event_json).await;

        span.set_attr(ATTR_HOOK_EXIT_CODE, result.exit_code as i64);
        span.set_attr(ATTR_HOOK_DURATION_MS, result.duration_ms);
        span.set_attr(ATTR_HOOK_STDOUT_LENGTH, result.stdout.len() as i64);
        span.set_attr(ATTR_HOOK_STDERR_LENGTH, result.stderr_len as i64);
        if let Some(err) = &result.spawn_error {
            span.set_attr(ATTR_HOOK_ERROR, err.as_str());
        }
        span.set_status(if result.failed() {
            SpanStatus::Error(result.spawn_error.clone())
        } else {
            SpanStatus::Ok
        });
        span.end();

        let blocking = result
            .response()
            .filter(|r| r.get("continue") == Some(&Value::Bool(false)));
        if let Some(response) = blocking {
            let stdout_payload = result.stdout.trim().to_string();
            results.push(result);
            return HookOutcome {
                response,
                stdout_payload,
                blocked: true,
                results,
            };
        }
        results.push(result);
    }

    let response = merge_responses(results.iter().filter_map(ExecResult::response));
    HookOutcome {
        stdout_payload: response.to_string(),
        response,
        blocked: false,
        results,
    }
}

async fn exec_one(command: &str, event_json: &str) -> ExecResult {
    let start = Instant::now();
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return ExecResult {
                command: command.to_string(),
                exit_code: -1,
                stdout: String::new(),
                stderr_len: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                spawn_error: Some(e.to_string()),
            }
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        // A hook that never reads stdin closes the pipe early; that is fine.
        let _ = stdin.write_all(event_json.as_bytes()).await;
    }

    match child.wait_with_output().await {
        Ok(output) => ExecResult {
            command: command.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr_len: output.stderr.len(),
            duration_ms: start.elapsed().as_millis() as u64,
            spawn_error: None,
        },
        Err(e) => ExecResult {
            command: command.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr_len: 0,
            duration_ms: start.elapsed().as_millis() as u64,
            spawn_error: Some(e.to_string()),
        },
    }
}

fn merge_responses(responses: impl Iterator<Item = Value>) -> Value {
    let mut composite = json!({"continue": true});
    let mut decision_taken = false;
    for response in responses {
        let Some(obj) = response.as_object() else {
            continue;
        };
        if composite.get("stopReason").is_none() {
            if let Some(stop) = obj.get("stopReason").filter(|v| !v.is_null()) {
                composite["stopReason"] = stop.clone();
            }
        }
        if !decision_taken {
            if let Some(decision) = obj.get("decision").filter(|v| !v.is_null()) {
                composite["decision"] = decision.clone();
                if let Some(reason) = obj.get("reason").filter(|v| !v.is_null()) {
                    composite["reason"] = reason.clone();
                }
                decision_taken = true;
            }
        }
        if composite.get("suppressOutput").is_none() {
            if let Some(suppress) = obj.get("suppressOutput").filter(|v| !v.is_null()) {
                composite["suppressOutput"] = suppress.clone();
            }
        }
    }
    composite
}

/// Emit the tool execution span for a PostToolUse event (the execution
/// itself happened inside the host; this is where it becomes observable).
/// `duration_ms` is the orchestrator's handling wall time, the closest
/// available measure.
pub fn emit_tool_span(
    tracer: &Arc<Tracer>,
    event: &HookEvent,
    store: &ToolUseStore,
    duration_ms: u64,
) {
    let Some(tool_name) = event.tool_name.as_deref() else {
        return;
    };
    let input = event.tool_input.clone().unwrap_or(Value::Null);
    let input_str = crate::correlate::canonical_json(&input);
    let span = tracer.start_tool_span(tool_name, &input_str, event.mcp_server(), None);

    let output = match &event.tool_response {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    span.set_attr(ATTR_TOOL_OUTPUT, output);
    span.set_attr(ATTR_TOOL_DURATION_MS, duration_ms);
    if let Some(tool_use_id) = store.resolve(tool_name, &input) {
        span.set_attr(ATTR_TOOL_USE_ID, tool_use_id);
    }
    span.set_status(SpanStatus::Ok);
    span.end();
}
