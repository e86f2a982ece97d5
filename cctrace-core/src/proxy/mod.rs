//! Loopback intercepting proxy.
//!
//! The wrapper publishes `ANTHROPIC_BASE_URL=http://127.0.0.1:<port>` to the
//! host child, so every provider request arrives here. Requests are replayed
//! against the real base URL and the response is streamed back unchanged
//! while a tee accumulates it; when the body completes, the capture path
//! parses it (JSON or SSE) and finishes the API span. Interception must
//! never change what the host receives — parse failures are recorded on the
//! span and swallowed.

pub mod capture;
pub mod forward;
pub mod sse;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::Stream;
use serde_json::Value;
use tracing::warn;

use crate::config::TraceCfg;
use crate::correlate::ToolUseStore;
use crate::error::{CcTraceError, CoreResult};
use crate::otlp::{
    SpanStatus, ATTR_AI_CACHE_READ, ATTR_AI_CACHE_WRITE, ATTR_AI_COST_KNOWN, ATTR_AI_COST_USD,
    ATTR_AI_MODEL, ATTR_AI_PROMPT, ATTR_AI_RAW_PATH, ATTR_AI_RESPONSE, ATTR_AI_STOP_REASON,
    ATTR_AI_TOKENS_INPUT, ATTR_AI_TOKENS_INPUT_SOURCE, ATTR_AI_TOKENS_OUTPUT,
    ATTR_HTTP_REQUEST_ID, ATTR_HTTP_STATUS_CODE,
};
use crate::pricing;
use crate::tracer::{SpanHandle, Tracer};
use capture::{
    estimate_input_tokens, prompt_from_request, spill_raw, truncate_attr, Capture, SPILL_BYTES,
};
use forward::{extract_request_id, ForwardClient};

/// Response headers the proxy recomputes instead of forwarding: the tee
/// re-frames the body, so upstream framing headers would lie.
const SKIP_RESPONSE_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

struct ProxyState {
    client: ForwardClient,
    tracer: Arc<Tracer>,
    store: Arc<ToolUseStore>,
    raw_dir: PathBuf,
}

pub struct ProxyServer {
    listener: tokio::net::TcpListener,
    router: Router,
    port: u16,
}

impl ProxyServer {
    pub async fn bind(
        cfg: &TraceCfg,
        tracer: Arc<Tracer>,
        store: Arc<ToolUseStore>,
        raw_dir: PathBuf,
    ) -> CoreResult<Self> {
        let client = ForwardClient::new_with(&cfg.http, &cfg.ai_base_url)?;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(CcTraceError::from)?;
        let port = listener.local_addr().map_err(CcTraceError::from)?.port();
        let state = Arc::new(ProxyState {
            client,
            tracer,
            store,
            raw_dir,
        });
        let router = Router::new().fallback(intercept).with_state(state);
        Ok(Self {
            listener,
            router,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` resolves. Run this on its own task.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) {
        let server = axum::serve(self.listener, self.router).with_graceful_shutdown(shutdown);
        if let Err(e) = server.await {
            warn!("proxy server stopped with error: {e}");
        }
    }
}

async fn intercept(
    State(state): State<Arc<ProxyState>>,
    req: axum::http::Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            )
        }
    };

    let is_messages =
        parts.method == Method::POST && parts.uri.path().trim_end_matches('/') == "/v1/messages";
    if !is_messages {
        // Not a completion call (model listing, token counting, …):
        // forward transparently, no span.
        return passthrough(&state, parts.method, &path_and_query, &parts.headers, body).await;
    }

    let upstream_url = format!("{}{}", state.client.base_url(), path_and_query);
    let span = state.tracer.start_api_span(parts.method.as_str(), &upstream_url);
    let request_json: Option<Value> = serde_json::from_slice(&body).ok();
    let request_text = match &request_json {
        Some(v) => prompt_from_request(v),
        None => String::from_utf8_lossy(&body).to_string(),
    };
    attach_text_attr(&span, ATTR_AI_PROMPT, &request_text, &state.raw_dir);

    let resp = match state
        .client
        .forward(parts.method, &path_and_query, &parts.headers, body.to_vec())
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            // Network errors are recorded and surfaced to the host as a 502
            // so its own retry logic can take over.
            span.record_exception(&err.to_string());
            span.set_status(SpanStatus::Error(Some(err.to_string())));
            span.end();
            return error_response(StatusCode::BAD_GATEWAY, &err.to_string());
        }
    };

    let status = resp.status();
    let headers = resp.headers().clone();
    span.set_attr(ATTR_HTTP_STATUS_CODE, status.as_u16() as i64);
    if let Some(request_id) = extract_request_id(&headers) {
        span.set_attr(ATTR_HTTP_REQUEST_ID, request_id);
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let finish = FinishCapture {
        span,
        store: state.store.clone(),
        raw_dir: state.raw_dir.clone(),
        status_code: status.as_u16(),
        content_type,
        request_text,
    };
    let tee = TeeBody::new(Box::pin(resp.bytes_stream()), move |body| finish.run(&body));
    build_response(status, &headers, Body::from_stream(tee))
}

async fn passthrough(
    state: &ProxyState,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    match state
        .client
        .forward(method, path_and_query, headers, body.to_vec())
        .await
    {
        Ok(resp) => {
            let status = resp.status();
            let headers = resp.headers().clone();
            build_response(status, &headers, Body::from_stream(resp.bytes_stream()))
        }
        Err(err) => error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

fn build_response(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers {
        let skip = SKIP_RESPONSE_HEADERS
            .iter()
            .any(|s| name.as_str().eq_ignore_ascii_case(s));
        if !skip {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(body)
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build"))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "type": "error",
        "error": {"type": "proxy_error", "message": message},
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static error response")
}

/// Everything needed to finish the API span once the response body has fully
/// streamed through.
struct FinishCapture {
    span: SpanHandle,
    store: Arc<ToolUseStore>,
    raw_dir: PathBuf,
    status_code: u16,
    content_type: String,
    request_text: String,
}

impl FinishCapture {
    fn run(self, body: &[u8]) {
        let text = String::from_utf8_lossy(body);
        let capture = if sse::is_sse(&self.content_type) {
            sse::parse_sse(&text)
        } else {
            match Capture::from_json(body) {
                Ok(c) => c,
                Err(e) => {
                    self.span
                        .record_exception(&format!("response parse failed: {e}"));
                    Capture::default()
                }
            }
        };
        self.apply(capture, &text);
    }

    fn apply(self, capture: Capture, raw_body: &str) {
        let span = &self.span;
        if let Some(model) = &capture.model {
            span.set_attr(ATTR_AI_MODEL, model.as_str());
        }

        let mut usage = capture.usage;
        let input_source = if usage.input_tokens.is_some() {
            "api"
        } else {
            usage.input_tokens = Some(estimate_input_tokens(&self.request_text));
            "estimated"
        };
        let counts = usage.to_counts();
        span.set_attr(ATTR_AI_TOKENS_INPUT, counts.input);
        span.set_attr(ATTR_AI_TOKENS_OUTPUT, counts.output);
        span.set_attr(ATTR_AI_CACHE_READ, counts.cache_read);
        span.set_attr(ATTR_AI_CACHE_WRITE, counts.cache_write);
        span.set_attr(ATTR_AI_TOKENS_INPUT_SOURCE, input_source);

        match capture.model.as_deref().and_then(pricing::lookup) {
            Some(rates) => {
                span.set_attr(ATTR_AI_COST_USD, pricing::cost_usd(counts, rates));
                span.set_attr(ATTR_AI_COST_KNOWN, true);
            }
            None => {
                span.set_attr(ATTR_AI_COST_USD, 0.0);
                span.set_attr(ATTR_AI_COST_KNOWN, false);
            }
        }

        if let Some(stop) = &capture.stop_reason {
            span.set_attr(ATTR_AI_STOP_REASON, stop.as_str());
        }
        let response_text = if capture.text.is_empty() {
            raw_body
        } else {
            &capture.text
        };
        attach_text_attr(span, ATTR_AI_RESPONSE, response_text, &self.raw_dir);

        for tool_use in &capture.tool_uses {
            self.store
                .record(&tool_use.id, &tool_use.name, &tool_use.input);
        }

        let ok = (200..300).contains(&self.status_code);
        span.set_status(if ok {
            SpanStatus::Ok
        } else {
            SpanStatus::Error(Some(format!("HTTP {}", self.status_code)))
        });
        self.span.end();
    }
}

/// Truncate a prompt/response attribute to the span limit, spilling the full
/// payload to `raw/` when it is large enough to matter.
fn attach_text_attr(span: &SpanHandle, key: &str, text: &str, raw_dir: &std::path::Path) {
    if text.len() > SPILL_BYTES {
        match spill_raw(raw_dir, text) {
            Ok(path) => span.set_attr(ATTR_AI_RAW_PATH, path.display().to_string()),
            Err(e) => warn!("raw spill failed: {e}"),
        }
    }
    span.set_attr(key, truncate_attr(text));
}

/// Pass-through body stream that accumulates chunks and invokes a finish
/// callback exactly once when the upstream body ends (or fails).
struct TeeBody<S, F>
where
    F: FnOnce(Vec<u8>),
{
    inner: S,
    buffer: Vec<u8>,
    finish: Option<F>,
}

impl<S, F> TeeBody<S, F>
where
    F: FnOnce(Vec<u8>),
{
    fn new(inner: S, finish: F) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            finish: Some(finish),
        }
    }
}

impl<S, F> Stream for TeeBody<S, F>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
    F: FnOnce(Vec<u8>) + Unpin,
{
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.buffer.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Mid-stream failure: finish with what we have, then let the
                // error reach the host untouched.
                if let Some(finish) = this.finish.take() {
                    finish(std::mem::take(&mut this.buffer));
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(finish) = this.finish.take() {
                    finish(std::mem::take(&mut this.buffer));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otlp::AttrValue;
    use crate::test_util::CaptureSink;
    use httpmock::Method::POST as MockPost;
    use httpmock::MockServer;
    use serde_json::json;
    use tempfile::tempdir;

    struct Harness {
        sink: Arc<CaptureSink>,
        store: Arc<ToolUseStore>,
        base: String,
        _raw: tempfile::TempDir,
    }

    async fn start_proxy(upstream: &MockServer) -> Harness {
        let raw = tempdir().unwrap();
        let sink = Arc::new(CaptureSink::default());
        let tracer = Tracer::new("proxy-test", sink.clone());
        let store = Arc::new(ToolUseStore::in_memory());
        let cfg = TraceCfg {
            ai_base_url: upstream.base_url(),
            ..Default::default()
        };
        let server = ProxyServer::bind(&cfg, tracer, store.clone(), raw.path().to_path_buf())
            .await
            .unwrap();
        let base = format!("http://127.0.0.1:{}", server.port());
        tokio::spawn(server.serve(std::future::pending()));
        Harness {
            sink,
            store,
            base,
            _raw: raw,
        }
    }

    fn api_span(sink: &CaptureSink) -> crate::otlp::Span {
        sink.spans()
            .into_iter()
            .find(|s| s.name.starts_with("API "))
            .expect("api span emitted")
    }

    async fn wait_for_span(sink: &CaptureSink) {
        for _ in 0..50 {
            if sink.spans().iter().any(|s| s.name.starts_with("API ")) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("api span never arrived");
    }

    #[tokio::test]
    async fn json_response_capture() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(MockPost).path("/v1/messages");
            then.status(200)
                .header("content-type", "application/json")
                .header("request-id", "req_1")
                .json_body(json!({
                    "model": "claude-sonnet-4-5",
                    "usage": {"input_tokens": 100, "output_tokens": 50,
                              "cache_read_input_tokens": 0, "cache_creation_input_tokens": 0},
                    "content": [{"type": "text", "text": "hello"}]
                }));
        });
        let h = start_proxy(&upstream).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/messages", h.base))
            .json(&json!({"model": "claude-sonnet-4-5",
                          "messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["content"][0]["text"], "hello");

        wait_for_span(&h.sink).await;
        let span = api_span(&h.sink);
        assert_eq!(span.attr(ATTR_AI_TOKENS_INPUT), Some(&AttrValue::Int(100)));
        assert_eq!(span.attr(ATTR_AI_TOKENS_OUTPUT), Some(&AttrValue::Int(50)));
        assert_eq!(
            span.attr(ATTR_AI_TOKENS_INPUT_SOURCE),
            Some(&AttrValue::Str("api".into()))
        );
        assert_eq!(span.attr(ATTR_AI_COST_KNOWN), Some(&AttrValue::Bool(true)));
        let rates = pricing::lookup("claude-sonnet-4-5").unwrap();
        let expected = 100.0 * rates.input / 1e6 + 50.0 * rates.output / 1e6;
        let cost = span.attr(ATTR_AI_COST_USD).unwrap().as_f64().unwrap();
        assert!((cost - expected).abs() < 1e-9);
        let response = span.attr(ATTR_AI_RESPONSE).unwrap().as_str().unwrap();
        assert!(response.contains("hello"));
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(
            span.attr(ATTR_HTTP_REQUEST_ID),
            Some(&AttrValue::Str("req_1".into()))
        );
    }

    #[tokio::test]
    async fn sse_response_capture() {
        let sse_body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":200}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"a\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"b\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"c\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(MockPost).path("/v1/messages");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body);
        });
        let h = start_proxy(&upstream).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/v1/messages", h.base))
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        // The host sees the SSE stream byte-identical.
        assert_eq!(resp.text().await.unwrap(), sse_body);

        wait_for_span(&h.sink).await;
        let span = api_span(&h.sink);
        assert_eq!(span.attr(ATTR_AI_TOKENS_INPUT), Some(&AttrValue::Int(200)));
        assert_eq!(span.attr(ATTR_AI_TOKENS_OUTPUT), Some(&AttrValue::Int(3)));
        assert_eq!(
            span.attr(ATTR_AI_RESPONSE),
            Some(&AttrValue::Str("abc".into()))
        );
    }

    #[tokio::test]
    async fn tool_use_blocks_reach_the_correlator() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(MockPost).path("/v1/messages");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "model": "claude-sonnet-4-5",
                    "usage": {"input_tokens": 1, "output_tokens": 1},
                    "content": [{"type": "tool_use", "id": "tu_1",
                                 "name": "read_file", "input": {"path": "/x"}}]
                }));
        });
        let h = start_proxy(&upstream).await;

        reqwest::Client::new()
            .post(format!("{}/v1/messages", h.base))
            .json(&json!({"messages": []}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        wait_for_span(&h.sink).await;
        assert_eq!(
            h.store.resolve("read_file", &json!({"path": "/x"})),
            Some("tu_1".to_string())
        );
    }

    #[tokio::test]
    async fn missing_input_tokens_are_estimated() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(MockPost).path("/v1/messages");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"model": "mystery-model",
                                  "content": [{"type": "text", "text": "ok"}]}));
        });
        let h = start_proxy(&upstream).await;

        reqwest::Client::new()
            .post(format!("{}/v1/messages", h.base))
            .json(&json!({"messages": [{"role": "user",
                          "content": "a reasonably sized prompt body"}]}))
            .send()
            .await
            .unwrap();

        wait_for_span(&h.sink).await;
        let span = api_span(&h.sink);
        assert_eq!(
            span.attr(ATTR_AI_TOKENS_INPUT_SOURCE),
            Some(&AttrValue::Str("estimated".into()))
        );
        assert!(span.attr(ATTR_AI_TOKENS_INPUT).unwrap().as_i64().unwrap() > 0);
        // Unknown model: zero cost, flagged unknown.
        assert_eq!(span.attr(ATTR_AI_COST_KNOWN), Some(&AttrValue::Bool(false)));
        assert_eq!(
            span.attr(ATTR_AI_COST_USD).unwrap().as_f64().unwrap(),
            0.0
        );
    }

    #[tokio::test]
    async fn non_2xx_marks_span_error_but_body_passes_through() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(MockPost).path("/v1/messages");
            then.status(429)
                .header("content-type", "application/json")
                .body(r#"{"type":"error","error":{"type":"rate_limit_error"}}"#);
        });
        let h = start_proxy(&upstream).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/v1/messages", h.base))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 429);
        assert!(resp.text().await.unwrap().contains("rate_limit_error"));

        wait_for_span(&h.sink).await;
        let span = api_span(&h.sink);
        assert_eq!(
            span.attr(ATTR_HTTP_STATUS_CODE),
            Some(&AttrValue::Int(429))
        );
        assert!(matches!(span.status, SpanStatus::Error(_)));
    }

    #[tokio::test]
    async fn non_messages_paths_pass_through_without_spans() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.path("/v1/models");
            then.status(200).json_body(json!({"data": []}));
        });
        let h = start_proxy(&upstream).await;

        let resp = reqwest::Client::new()
            .get(format!("{}/v1/models", h.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(h.sink.spans().is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_502_and_error_span() {
        let raw = tempdir().unwrap();
        let sink = Arc::new(CaptureSink::default());
        let tracer = Tracer::new("proxy-err", sink.clone());
        let cfg = TraceCfg {
            ai_base_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let server = ProxyServer::bind(
            &cfg,
            tracer,
            Arc::new(ToolUseStore::in_memory()),
            raw.path().to_path_buf(),
        )
        .await
        .unwrap();
        let base = format!("http://127.0.0.1:{}", server.port());
        tokio::spawn(server.serve(std::future::pending()));

        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/messages"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["type"], "error");

        wait_for_span(&sink).await;
        let span = sink
            .spans()
            .into_iter()
            .find(|s| s.name.starts_with("API "))
            .unwrap();
        assert!(matches!(span.status, SpanStatus::Error(_)));
        assert!(span.attr(crate::otlp::ATTR_EXCEPTION_MESSAGE).is_some());
    }
}
