//! Upstream forwarding client.
//!
//! Thin wrapper around `reqwest::Client` that replays the host's request
//! against the real provider base URL. No retries: the host owns retry
//! policy, and replaying a non-idempotent completion would double-bill.

use reqwest::header::{HeaderMap, HeaderName};
use reqwest::{Client, Method};

use crate::config::HttpCfg;
use crate::error::{CcTraceError, CoreResult};

/// Request headers that must not be replayed upstream. `host` and
/// `content-length` are recomputed by the client; `accept-encoding` is
/// dropped to pin the exchange to identity encoding so the response tee can
/// parse what it captures.
const SKIP_REQUEST_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "accept-encoding",
];

#[derive(Clone, Debug)]
pub struct ForwardClient {
    inner: Client,
    base_url: String,
}

impl ForwardClient {
    pub fn new_with(cfg: &HttpCfg, base_url: &str) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(std::time::Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| CcTraceError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replay one request upstream and return the raw response for teeing.
    /// All forwardable headers — including the host's credential headers —
    /// pass through verbatim. Network errors surface as `Upstream`.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> CoreResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut req = self.inner.request(method, &url);
        for (name, value) in headers {
            if is_forwardable(name) {
                req = req.header(name, value);
            }
        }
        if !body.is_empty() {
            req = req.body(body);
        }
        req.send().await.map_err(|e| CcTraceError::Upstream {
            status: "network".to_string(),
            message: e.to_string(),
        })
    }
}

fn is_forwardable(name: &HeaderName) -> bool {
    !SKIP_REQUEST_HEADERS
        .iter()
        .any(|skip| name.as_str().eq_ignore_ascii_case(skip))
}

/// Provider request id from response headers, for span attribution.
pub fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["request-id", "x-request-id", "anthropic-request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k) {
            if let Ok(s) = v.to_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}
