//! Append-only OTLP JSONL writer.
//!
//! Each export call appends one newline-terminated ResourceSpans document to
//! `<run_dir>/trace.otlp.jsonl`. The file is shared append-only across OS
//! processes (wrapper + every orchestrator invocation); writes that can
//! exceed the pipe-buffer atomicity bound are serialized under an advisory
//! `flock`.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use fs2::FileExt;
use tracing::error;

use super::span::{encode_batch, Span, ATTR_EXPORT_ERROR, ATTR_PARENT_SESSION_ID, ATTR_SESSION_ID};
use crate::error::{CcTraceError, CoreResult};

/// Atomicity bound for unlocked appends (POSIX PIPE_BUF).
const ATOMIC_APPEND_BYTES: usize = 4096;

/// Implement this to receive finished spans.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `export` may be called from any thread and must not panic; failures are
///   the implementation's to log.
pub trait SpanSink: Send + Sync + 'static {
    fn export(&self, batch: &[Span]);

    fn shutdown(&self) {}
}

/// Session attributes stamped onto every exported span.
#[derive(Debug, Clone, Default)]
struct SessionStamp {
    session_id: String,
    parent_session_id: Option<String>,
}

pub struct OtlpWriter {
    path: PathBuf,
    stamp: Mutex<SessionStamp>,
    /// Error kinds already reported, to keep stderr noise at one line per
    /// kind per process (spec: log once, drop the batch, stay operational).
    reported: Mutex<HashSet<std::io::ErrorKind>>,
}

impl OtlpWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            stamp: Mutex::new(SessionStamp::default()),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Update the session attributes used for all future exports. Spans
    /// already on disk keep whatever stamp they were written with; readers
    /// take the root span's value as authoritative.
    pub fn update_session(&self, session_id: &str, parent_session_id: Option<&str>) {
        let mut stamp = self.stamp.lock().unwrap();
        stamp.session_id = session_id.to_string();
        stamp.parent_session_id = parent_session_id.map(String::from);
    }

    /// Serialize and append one batch. Infallible past configuration errors:
    /// a span that will not serialize is replaced with a degraded marker
    /// span, and I/O failures drop the batch after a once-per-kind log line.
    pub fn try_export(&self, batch: &[Span]) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let stamped: Vec<Span> = batch.iter().map(|s| self.stamped(s)).collect();
        let safe: Vec<Span> = stamped.into_iter().map(sanitize_span).collect();
        let doc = encode_batch(&safe);
        let mut line =
            serde_json::to_string(&doc).map_err(|e| CcTraceError::Other(e.into()))?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CcTraceError::Writer {
                path: self.path.clone(),
                source: e,
            })?;

        // Appends at or under PIPE_BUF are atomic on their own; anything
        // larger is serialized against concurrent exporters with flock.
        let needs_lock = line.len() > ATOMIC_APPEND_BYTES || safe.len() > 1;
        if needs_lock {
            file.lock_exclusive().map_err(|e| CcTraceError::Writer {
                path: self.path.clone(),
                source: e,
            })?;
        }
        let result = (&file).write_all(line.as_bytes());
        if needs_lock {
            let _ = fs2::FileExt::unlock(&file);
        }
        result.map_err(|e| CcTraceError::Writer {
            path: self.path.clone(),
            source: e,
        })
    }

    fn stamped(&self, span: &Span) -> Span {
        let stamp = self.stamp.lock().unwrap();
        let mut span = span.clone();
        span.set_attr(ATTR_SESSION_ID, stamp.session_id.as_str());
        if let Some(parent) = &stamp.parent_session_id {
            span.set_attr(ATTR_PARENT_SESSION_ID, parent.as_str());
        }
        span
    }

    fn report_once(&self, err: &CcTraceError) {
        let kind = match err {
            CcTraceError::Writer { source, .. } => source.kind(),
            CcTraceError::Io(e) => e.kind(),
            _ => std::io::ErrorKind::Other,
        };
        if self.reported.lock().unwrap().insert(kind) {
            error!(path = %self.path.display(), "span export failed, dropping batch: {err}");
        }
    }
}

impl SpanSink for OtlpWriter {
    fn export(&self, batch: &[Span]) {
        if let Err(err) = self.try_export(batch) {
            self.report_once(&err);
        }
    }
}

/// Replace attribute values that cannot survive JSON encoding (non-finite
/// doubles) so one bad span never drops its batch. The span keeps its
/// identity and gains an `export.error` marker.
fn sanitize_span(mut span: Span) -> Span {
    use super::span::AttrValue;
    let mut degraded = false;
    for (_, value) in span.attributes.iter_mut() {
        if let AttrValue::Double(d) = value {
            if !d.is_finite() {
                *value = AttrValue::Str(format!("{d}"));
                degraded = true;
            }
        }
    }
    if degraded {
        span.set_attr(ATTR_EXPORT_ERROR, "non-finite double value");
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otlp::span::{decode_batch, AttrValue, SpanKind, SpanStatus};
    use tempfile::tempdir;

    fn span(name: &str) -> Span {
        Span {
            trace_id: "0123456789abcdef0123456789abcdef".into(),
            span_id: crate::otlp::span::new_span_id(),
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_unix_nano: 1,
            end_unix_nano: 2,
            attributes: Vec::new(),
            status: SpanStatus::Ok,
        }
    }

    #[test]
    fn export_appends_one_line_per_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.otlp.jsonl");
        let writer = OtlpWriter::new(path.clone());
        writer.export(&[span("a")]);
        writer.export(&[span("b"), span("c")]);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(decode_batch(lines[0]).unwrap().len(), 1);
        assert_eq!(decode_batch(lines[1]).unwrap().len(), 2);
    }

    #[test]
    fn every_span_carries_session_stamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.otlp.jsonl");
        let writer = OtlpWriter::new(path.clone());
        writer.export(&[span("before")]);
        writer.update_session("sess-42", Some("outer-7"));
        writer.export(&[span("after")]);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        let before = &decode_batch(lines[0]).unwrap()[0];
        let after = &decode_batch(lines[1]).unwrap()[0];
        assert_eq!(
            before.attr(ATTR_SESSION_ID),
            Some(&AttrValue::Str(String::new()))
        );
        assert!(before.attr(ATTR_PARENT_SESSION_ID).is_none());
        assert_eq!(
            after.attr(ATTR_SESSION_ID),
            Some(&AttrValue::Str("sess-42".into()))
        );
        assert_eq!(
            after.attr(ATTR_PARENT_SESSION_ID),
            Some(&AttrValue::Str("outer-7".into()))
        );
    }

    #[test]
    fn non_finite_double_degrades_instead_of_dropping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.otlp.jsonl");
        let writer = OtlpWriter::new(path.clone());
        let mut bad = span("bad");
        bad.set_attr("x", f64::NAN);
        writer.export(&[bad, span("good")]);

        let content = std::fs::read_to_string(&path).unwrap();
        let spans = decode_batch(content.lines().next().unwrap()).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(
            spans[0].attr(ATTR_EXPORT_ERROR),
            Some(&AttrValue::Str("non-finite double value".into()))
        );
        assert_eq!(spans[0].attr("x"), Some(&AttrValue::Str("NaN".into())));
    }

    #[test]
    fn unwritable_directory_reports_and_survives() {
        let writer = OtlpWriter::new(PathBuf::from("/definitely/missing/trace.otlp.jsonl"));
        // Must not panic, and stays usable for subsequent calls.
        writer.export(&[span("a")]);
        writer.export(&[span("b")]);
        let err = writer.try_export(&[span("c")]).unwrap_err();
        assert!(matches!(err, CcTraceError::Writer { .. }));
    }

    #[test]
    fn oversized_batch_still_lands_as_one_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.otlp.jsonl");
        let writer = OtlpWriter::new(path.clone());
        let mut big = span("big");
        big.set_attr("payload", "x".repeat(ATOMIC_APPEND_BYTES * 2));
        writer.export(&[big]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(decode_batch(content.lines().next().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_exports_interleave_whole_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.otlp.jsonl");
        let writer = std::sync::Arc::new(OtlpWriter::new(path.clone()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let w = writer.clone();
                std::thread::spawn(move || {
                    for j in 0..20 {
                        w.export(&[span(&format!("t{i}-{j}"))]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let mut seen = 0;
        for line in content.lines() {
            let spans = decode_batch(line).expect("every line parses");
            seen += spans.len();
        }
        assert_eq!(seen, 160);
    }
}
