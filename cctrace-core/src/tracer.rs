//! Tracer core: the process-wide span factory.
//!
//! Each participating OS process (the wrapper, every `cctrace-hook`
//! invocation) initializes its own tracer; coordination happens only through
//! the shared JSONL file. Trace and root-span ids are derived
//! deterministically from the run id, so spans from different processes
//! assemble into one tree without IPC.
//!
//! By default no tracer is installed; binaries install one via
//! [`install`], mirroring a write-once global sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::error::CoreResult;
use crate::otlp::span::{new_span_id, now_unix_nano, Span, SpanKind, SpanStatus};
use crate::otlp::writer::SpanSink;
use crate::otlp::{
    ATTR_EXCEPTION_MESSAGE, ATTR_HOOK_COMMAND, ATTR_HOOK_EVENT, ATTR_MCP_SERVER, ATTR_SESSION_ID,
    ATTR_TOOL_INPUT, ATTR_TOOL_NAME,
};
use crate::run::{root_span_id, trace_id};

static TRACER: OnceCell<Arc<Tracer>> = OnceCell::new();

/// Install the process-wide tracer. Returns `false` if one is already
/// installed (write-once for the process lifetime).
pub fn install(tracer: Arc<Tracer>) -> bool {
    TRACER.set(tracer).is_ok()
}

/// The process-wide tracer, if one was installed.
pub fn global() -> Option<Arc<Tracer>> {
    TRACER.get().cloned()
}

pub struct Tracer {
    trace_id: String,
    root_span_id: String,
    sink: Arc<dyn SpanSink>,
    /// The open root session span. None when this process attached to a run
    /// owned by another process (the orchestrator case) — the root belongs
    /// to the wrapper and must not be emitted twice.
    root: Mutex<Option<Span>>,
    /// Pool of open spans keyed by span id.
    open: Mutex<HashMap<String, Span>>,
}

impl Tracer {
    /// Create the run-owning tracer: opens the root session span. The root
    /// stays open for the whole run and is emitted by [`Tracer::finish`].
    pub fn new(run_id: &str, sink: Arc<dyn SpanSink>) -> Arc<Self> {
        let root = Span {
            trace_id: trace_id(run_id),
            span_id: root_span_id(run_id),
            parent_span_id: None,
            name: format!("Session {run_id}"),
            kind: SpanKind::Internal,
            start_unix_nano: now_unix_nano(),
            end_unix_nano: 0,
            attributes: Vec::new(),
            status: SpanStatus::Unset,
        };
        Arc::new(Self {
            trace_id: trace_id(run_id),
            root_span_id: root_span_id(run_id),
            sink,
            root: Mutex::new(Some(root)),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Attach to a run owned by another process: same trace and root ids,
    /// but no root span of its own.
    pub fn attached(run_id: &str, sink: Arc<dyn SpanSink>) -> Arc<Self> {
        Arc::new(Self {
            trace_id: trace_id(run_id),
            root_span_id: root_span_id(run_id),
            sink,
            root: Mutex::new(None),
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn root_span_id(&self) -> &str {
        &self.root_span_id
    }

    /// Patch the session id onto the still-open root span. Spans already on
    /// disk keep their placeholder; the root's value is authoritative for
    /// readers. The caller is responsible for updating the writer stamp too.
    pub fn set_session_id(&self, session_id: &str) {
        if let Some(root) = self.root.lock().unwrap().as_mut() {
            root.set_attr(ATTR_SESSION_ID, session_id);
        }
    }

    fn start(
        self: &Arc<Self>,
        name: String,
        kind: SpanKind,
        parent: Option<&str>,
    ) -> SpanHandle {
        let span = Span {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(parent.unwrap_or(&self.root_span_id).to_string()),
            name,
            kind,
            start_unix_nano: now_unix_nano(),
            end_unix_nano: 0,
            attributes: Vec::new(),
            status: SpanStatus::Unset,
        };
        let id = span.span_id.clone();
        self.open.lock().unwrap().insert(id.clone(), span);
        SpanHandle {
            tracer: self.clone(),
            span_id: id,
        }
    }

    /// CLIENT span for an outbound AI-provider HTTP call.
    pub fn start_api_span(self: &Arc<Self>, method: &str, url: &str) -> SpanHandle {
        self.start(format!("API {method} {url}"), SpanKind::Client, None)
    }

    /// INTERNAL span for a completed tool execution.
    pub fn start_tool_span(
        self: &Arc<Self>,
        tool_name: &str,
        input: &str,
        mcp_server: Option<&str>,
        parent: Option<&str>,
    ) -> SpanHandle {
        let handle = self.start(format!("Tool: {tool_name}"), SpanKind::Internal, parent);
        handle.set_attr(ATTR_TOOL_NAME, tool_name);
        handle.set_attr(ATTR_TOOL_INPUT, input);
        if let Some(server) = mcp_server {
            handle.set_attr(ATTR_MCP_SERVER, server);
        }
        handle
    }

    /// INTERNAL span for a host hook event.
    pub fn start_hook_event_span(
        self: &Arc<Self>,
        event: &str,
        tool_name: Option<&str>,
    ) -> SpanHandle {
        let name = match tool_name {
            Some(tool) => format!("Hook: {event}[{tool}]"),
            None => format!("Hook: {event}"),
        };
        let handle = self.start(name, SpanKind::Internal, None);
        handle.set_attr(ATTR_HOOK_EVENT, event);
        if let Some(tool) = tool_name {
            handle.set_attr(ATTR_TOOL_NAME, tool);
        }
        handle
    }

    /// INTERNAL span for one user-hook command execution, parented to its
    /// hook event span.
    pub fn start_hook_exec_span(self: &Arc<Self>, command: &str, parent: &str) -> SpanHandle {
        let head = command.split_whitespace().next().unwrap_or(command);
        let handle = self.start(format!("Run: {head}"), SpanKind::Internal, Some(parent));
        handle.set_attr(ATTR_HOOK_COMMAND, command);
        handle
    }

    /// End the root span (if this process owns it), force-end anything still
    /// open, and flush everything to the sink.
    pub fn finish(&self) -> CoreResult<()> {
        let now = now_unix_nano();
        let mut batch: Vec<Span> = Vec::new();

        let leftover: Vec<Span> = self.open.lock().unwrap().drain().map(|(_, s)| s).collect();
        for mut span in leftover {
            span.end_unix_nano = now;
            batch.push(span);
        }

        if let Some(mut root) = self.root.lock().unwrap().take() {
            root.end_unix_nano = now;
            if root.status == SpanStatus::Unset {
                root.status = SpanStatus::Ok;
            }
            batch.push(root);
        }

        if !batch.is_empty() {
            self.sink.export(&batch);
        }
        self.sink.shutdown();
        Ok(())
    }

    fn end_span(&self, span_id: &str) {
        let span = self.open.lock().unwrap().remove(span_id);
        if let Some(mut span) = span {
            span.end_unix_nano = now_unix_nano();
            self.sink.export(&[span]);
        }
    }

    fn with_span(&self, span_id: &str, f: impl FnOnce(&mut Span)) {
        if let Some(span) = self.open.lock().unwrap().get_mut(span_id) {
            f(span);
        }
    }
}

/// Mutable handle to an open span. Ending the span enqueues it to the writer
/// immediately; spans are never held until session end.
pub struct SpanHandle {
    tracer: Arc<Tracer>,
    span_id: String,
}

impl SpanHandle {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn set_attr(&self, key: &str, value: impl Into<crate::otlp::AttrValue>) {
        self.tracer.with_span(&self.span_id, |s| s.set_attr(key, value));
    }

    pub fn set_attrs<I>(&self, attrs: I)
    where
        I: IntoIterator<Item = (String, crate::otlp::AttrValue)>,
    {
        self.tracer.with_span(&self.span_id, |s| {
            for (k, v) in attrs {
                s.set_attr(&k, v);
            }
        });
    }

    /// Record a failure on the span without ending it. Parsing failures use
    /// this path so the span still carries whatever was extracted.
    pub fn record_exception(&self, message: &str) {
        self.tracer.with_span(&self.span_id, |s| {
            s.set_attr(ATTR_EXCEPTION_MESSAGE, message);
        });
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.tracer
            .with_span(&self.span_id, |s| s.status = status.clone());
    }

    pub fn end(self) {
        self.tracer.end_span(&self.span_id);
    }
}
