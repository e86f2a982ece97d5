use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::{CcTraceError, CoreResult};

/// Default AI-provider base URL the proxy forwards to.
pub const DEFAULT_AI_BASE_URL: &str = "https://api.anthropic.com";

/// Name of the profile directory under the user's home.
pub const PROFILE_DIR_NAME: &str = ".cctrace";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 600000ms; streaming
    /// completions can run for minutes)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    600_000
}

fn default_ai_base_url() -> String {
    DEFAULT_AI_BASE_URL.to_string()
}

/// Resolved runtime configuration for the wrapper and the hook orchestrator.
///
/// Sources, lowest to highest precedence: built-in defaults, an optional
/// `config.toml` / `config.json` in the profile directory, environment
/// variables (`AI_BASE_URL`, `OPEN_HTML`, `MOCK_HOST_PATH`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TraceCfg {
    /// Upstream provider base URL, e.g. `https://api.anthropic.com`.
    #[serde(default = "default_ai_base_url")]
    pub ai_base_url: String,
    /// Root of cctrace's on-disk state (`~/.cctrace` by default).
    #[serde(skip)]
    pub profile_dir: PathBuf,
    #[serde(default)]
    pub http: HttpCfg,
    /// Open the HTML report with the OS URL handler when the run ends.
    #[serde(default)]
    pub open_html: bool,
    /// Test override for the host binary path.
    #[serde(skip)]
    pub mock_host_path: Option<PathBuf>,
}

impl Default for TraceCfg {
    fn default() -> Self {
        Self {
            ai_base_url: default_ai_base_url(),
            profile_dir: default_profile_dir(),
            http: HttpCfg::default(),
            open_html: false,
            mock_host_path: None,
        }
    }
}

fn default_profile_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(PROFILE_DIR_NAME)
}

impl TraceCfg {
    /// Load configuration: defaults, then the profile config file if one
    /// exists, then environment overrides.
    pub fn load() -> CoreResult<Self> {
        let profile_dir = default_profile_dir();
        let mut cfg = match find_config_file(&profile_dir) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        cfg.profile_dir = profile_dir;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load a TraceCfg from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(CcTraceError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| CcTraceError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| CcTraceError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| CcTraceError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| CcTraceError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| CcTraceError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("AI_BASE_URL") {
            if !url.is_empty() {
                self.ai_base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(v) = env::var("OPEN_HTML") {
            self.open_html = v == "true" || v == "1";
        }
        if let Ok(p) = env::var("MOCK_HOST_PATH") {
            if !p.is_empty() {
                self.mock_host_path = Some(PathBuf::from(p));
            }
        }
    }
}

fn find_config_file(profile_dir: &Path) -> Option<PathBuf> {
    for name in ["config.toml", "config.json"] {
        let candidate = profile_dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
