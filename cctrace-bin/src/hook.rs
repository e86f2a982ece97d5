//! `cctrace-hook` — the hook orchestrator.
//!
//! Registered in the host's settings under cctrace's reserved hook entry,
//! invoked by the host for every hook event with the event JSON on stdin.
//! Re-executes the user's own configured hook commands under
//! instrumentation, merges their responses, and emits hook/tool spans into
//! the run's shared JSONL.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use cctrace_core::{
    correlate::ToolUseStore,
    hooks::{self, HookEvent},
    otlp::{OtlpWriter, SpanStatus, ATTR_HOOK_DURATION_MS, ATTR_HOOK_EXIT_CODE,
           ATTR_HOOK_PROJECT_DIR},
    run::{Run, ENV_OUTPUT_DIR, ENV_PARENT_SESSION, ENV_RUN_ID},
    tracer::{self, Tracer},
};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // A missing run identity is a wiring bug in the wrapper registration,
    // not a recoverable condition. One line, non-zero, out.
    let Ok(run_id) = std::env::var(ENV_RUN_ID) else {
        eprintln!("cctrace-hook: RUN_ID not set; is the host running under the cctrace wrapper?");
        return ExitCode::from(2);
    };
    let Ok(out_dir) = std::env::var(ENV_OUTPUT_DIR) else {
        eprintln!("cctrace-hook: OUTPUT_DIR not set; is the host running under the cctrace wrapper?");
        return ExitCode::from(2);
    };
    let run = match Run::attach(&run_id, &PathBuf::from(&out_dir)) {
        Ok(run) => run,
        Err(e) => {
            eprintln!("cctrace-hook: {e}");
            return ExitCode::from(2);
        }
    };

    let mut raw_event = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut raw_event) {
        eprintln!("cctrace-hook: failed to read event from stdin: {e}");
        return ExitCode::from(2);
    }
    let event = HookEvent::parse(&raw_event);
    let event_json = String::from_utf8_lossy(&raw_event).to_string();

    let writer = Arc::new(OtlpWriter::new(run.trace_file()));
    let parent_session = std::env::var(ENV_PARENT_SESSION).ok().filter(|s| !s.is_empty());
    writer.update_session(
        event.session_id.as_deref().unwrap_or(""),
        parent_session.as_deref(),
    );
    let tracer = Tracer::attached(&run.run_id, writer);
    tracer::install(tracer.clone());

    let started = Instant::now();
    let tool_name = event
        .is_tool_scoped()
        .then(|| event.tool_name.clone())
        .flatten();
    let event_span = tracer.start_hook_event_span(event.event_name(), tool_name.as_deref());
    if let Some(cwd) = &event.cwd {
        event_span.set_attr(ATTR_HOOK_PROJECT_DIR, cwd.as_str());
    }

    let home = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/".to_string()));
    let cwd = event
        .cwd
        .clone()
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let commands = match hooks::discover_commands(&event, &home, &cwd) {
        Ok(commands) => commands,
        Err(e) => {
            // User misconfiguration (malformed settings, bad matcher regex):
            // fail loudly rather than silently dropping their hooks.
            event_span.record_exception(&e.to_string());
            event_span.set_status(SpanStatus::Error(Some(e.to_string())));
            event_span.end();
            let _ = tracer.finish();
            eprintln!("cctrace-hook: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = hooks::run_hooks(&tracer, event_span.span_id(), &event_json, &commands).await;

    if event.is_post_tool_use() {
        let store = ToolUseStore::load_sidecar(&run.sidecar_file());
        hooks::emit_tool_span(
            &tracer,
            &event,
            &store,
            started.elapsed().as_millis() as u64,
        );
    }

    event_span.set_attr(ATTR_HOOK_DURATION_MS, started.elapsed().as_millis() as u64);
    event_span.set_attr(ATTR_HOOK_EXIT_CODE, outcome.worst_exit_code() as i64);
    event_span.set_status(if outcome.any_failed() {
        SpanStatus::Error(None)
    } else {
        SpanStatus::Ok
    });
    event_span.end();
    let _ = tracer.finish();

    // The composite response is the orchestrator's entire stdout; the host
    // parses it to decide whether to continue.
    print!("{}", outcome.stdout_payload);
    let _ = std::io::stdout().flush();

    ExitCode::SUCCESS
}
