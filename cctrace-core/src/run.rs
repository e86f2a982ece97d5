//! Run identity and on-disk layout.
//!
//! A run is one invocation of the host CLI through the wrapper. The run id
//! is a monotonic time-based opaque string; the session id is assigned by
//! the host and discovered later from the first hook event recorded in the
//! run's JSONL.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{CcTraceError, CoreResult};
use crate::otlp::span::ATTR_SESSION_ID;

pub const ENV_RUN_ID: &str = "RUN_ID";
pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_OUTPUT_DIR: &str = "OUTPUT_DIR";
pub const ENV_PARENT_SESSION: &str = "PARENT_SESSION";
pub const ENV_ANTHROPIC_BASE_URL: &str = "ANTHROPIC_BASE_URL";

pub const TRACE_FILE: &str = "trace.otlp.jsonl";
pub const REPORT_FILE: &str = "report.html";
pub const SIDECAR_FILE: &str = "tool_use.pending.jsonl";
pub const RAW_DIR: &str = "raw";

#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    /// Host-assigned session id; None until discovered from a hook event.
    pub session_id: Option<String>,
    pub run_dir: PathBuf,
    pub started_at: std::time::Instant,
}

impl Run {
    /// Create a fresh run with its directory under `<profile_dir>/logs/`.
    pub fn create(profile_dir: &Path) -> CoreResult<Self> {
        let run_id = new_run_id();
        let run_dir = profile_dir.join("logs").join(&run_id);
        fs::create_dir_all(run_dir.join(RAW_DIR)).map_err(|e| CcTraceError::Writer {
            path: run_dir.clone(),
            source: e,
        })?;
        Ok(Self {
            run_id,
            session_id: None,
            run_dir,
            started_at: std::time::Instant::now(),
        })
    }

    /// Join an existing run from another process. The directory must have
    /// been created by the wrapper; the orchestrator never creates runs.
    pub fn attach(run_id: &str, run_dir: &Path) -> CoreResult<Self> {
        if !run_dir.is_dir() {
            return Err(CcTraceError::Config(format!(
                "run directory does not exist: {}",
                run_dir.display()
            )));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            session_id: None,
            run_dir: run_dir.to_path_buf(),
            started_at: std::time::Instant::now(),
        })
    }

    pub fn trace_file(&self) -> PathBuf {
        self.run_dir.join(TRACE_FILE)
    }

    pub fn report_file(&self) -> PathBuf {
        self.run_dir.join(REPORT_FILE)
    }

    pub fn sidecar_file(&self) -> PathBuf {
        self.run_dir.join(SIDECAR_FILE)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.run_dir.join(RAW_DIR)
    }

    /// Environment published to the host child and, through it, to every
    /// hook orchestrator invocation. `SESSION_ID` starts blank and is filled
    /// in-band once discovered. When the wrapper itself already runs inside
    /// a traced session, that outer session id is forwarded as
    /// `PARENT_SESSION` so nested runs stay attributable.
    pub fn publish_env(&self, proxy_port: u16) -> Vec<(String, String)> {
        let mut env = vec![
            (ENV_RUN_ID.to_string(), self.run_id.clone()),
            (
                ENV_SESSION_ID.to_string(),
                self.session_id.clone().unwrap_or_default(),
            ),
            (
                ENV_OUTPUT_DIR.to_string(),
                self.run_dir.display().to_string(),
            ),
            (
                ENV_ANTHROPIC_BASE_URL.to_string(),
                format!("http://127.0.0.1:{proxy_port}"),
            ),
        ];
        if let Ok(outer) = std::env::var(ENV_SESSION_ID) {
            if !outer.is_empty() {
                env.push((ENV_PARENT_SESSION.to_string(), outer));
            }
        }
        env
    }
}

/// Monotonic time-based run identifier, e.g. `20260802-141503-9f2c1a`.
fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("{stamp}-{suffix}")
}

/// 128-bit trace id derived from the run id. Every process participating in
/// a run computes the same value from `RUN_ID` alone, so spans emitted by
/// the wrapper and by orchestrator subprocesses land in one trace without
/// any IPC.
pub fn trace_id(run_id: &str) -> String {
    let digest = Sha256::digest(run_id.as_bytes());
    hex_prefix(&digest, 16)
}

/// 64-bit id of the root session span, derived like [`trace_id`].
pub fn root_span_id(run_id: &str) -> String {
    let digest = Sha256::digest(format!("{run_id}/root").as_bytes());
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes[..n].iter().map(|b| format!("{b:02x}")).collect()
}

/// Scan the run's JSONL for the first span stamped with a non-empty
/// `session.id`. Spans written before discovery carry a blank stamp, so the
/// first non-empty value is the host-assigned session id.
pub fn discover_session_id(run_dir: &Path) -> Option<String> {
    let content = fs::read_to_string(run_dir.join(TRACE_FILE)).ok()?;
    for line in content.lines() {
        let doc: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        for span in crate::otlp::span::decode_batch_value(&doc) {
            if let Some(crate::otlp::span::AttrValue::Str(id)) = span.attr(ATTR_SESSION_ID) {
                if !id.is_empty() {
                    return Some(id.clone());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_builds_run_layout() {
        let dir = tempdir().unwrap();
        let run = Run::create(dir.path()).unwrap();
        assert!(run.run_dir.starts_with(dir.path().join("logs")));
        assert!(run.raw_dir().is_dir());
        assert!(run.trace_file().ends_with(TRACE_FILE));
        assert!(run.session_id.is_none());
    }

    #[test]
    fn run_ids_are_unique_and_time_prefixed() {
        let dir = tempdir().unwrap();
        let a = Run::create(dir.path()).unwrap();
        let b = Run::create(dir.path()).unwrap();
        assert_ne!(a.run_id, b.run_id);
        // YYYYmmdd-HHMMSS-xxxxxx
        assert_eq!(a.run_id.len(), "20260802-141503-9f2c1a".len());
    }

    #[test]
    fn attach_requires_existing_dir() {
        let dir = tempdir().unwrap();
        let run = Run::create(dir.path()).unwrap();
        let attached = Run::attach(&run.run_id, &run.run_dir).unwrap();
        assert_eq!(attached.run_id, run.run_id);

        let err = Run::attach("nope", &dir.path().join("missing")).unwrap_err();
        match err {
            CcTraceError::Config(msg) => assert!(msg.contains("missing")),
            other => panic!("expected Config error, got: {other:?}"),
        }
    }

    #[test]
    fn derived_ids_are_deterministic_and_sized() {
        let t1 = trace_id("run-a");
        let t2 = trace_id("run-a");
        assert_eq!(t1, t2);
        assert_eq!(t1.len(), 32);
        assert_ne!(trace_id("run-a"), trace_id("run-b"));

        let r = root_span_id("run-a");
        assert_eq!(r.len(), 16);
        assert_ne!(r, t1[..16]);
    }

    #[test]
    fn publish_env_carries_run_identity() {
        let dir = tempdir().unwrap();
        let run = Run::create(dir.path()).unwrap();
        let env = run.publish_env(8899);
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get(ENV_RUN_ID), Some(run.run_id.clone()));
        assert_eq!(get(ENV_SESSION_ID), Some(String::new()));
        assert_eq!(
            get(ENV_ANTHROPIC_BASE_URL),
            Some("http://127.0.0.1:8899".to_string())
        );
        assert!(get(ENV_OUTPUT_DIR).unwrap().contains("logs"));
    }
}
