use std::path::PathBuf;

use thiserror::Error;

/// Core error type for cctrace.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum CcTraceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("trace writer failed on {path}: {source}")]
    Writer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream request failed ({status}): {message}")]
    Upstream { status: String, message: String },

    #[error("hook command failed '{command}': {message}")]
    HookExec { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CcTraceError>;
