//! OpenTelemetry-compatible span model and its OTLP/JSON encoding.
//!
//! One JSONL line is one `{resourceSpans: [...]}` document. Timestamps are
//! decimal strings of nanoseconds since epoch; integer attribute values are
//! encoded as strings per the OTLP JSON mapping but accepted as either
//! strings or numbers on parse.

use serde_json::{json, Value};

pub use super::keys::*;

pub const SCOPE_NAME: &str = "cctrace";
pub const SERVICE_NAME: &str = "cctrace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    fn to_otlp(self) -> i64 {
        match self {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }

    fn from_otlp(v: i64) -> Self {
        match v {
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(Option<String>),
}

impl SpanStatus {
    fn to_otlp(&self) -> Value {
        match self {
            SpanStatus::Unset => json!({}),
            SpanStatus::Ok => json!({"code": 1}),
            SpanStatus::Error(None) => json!({"code": 2}),
            SpanStatus::Error(Some(msg)) => json!({"code": 2, "message": msg}),
        }
    }

    fn from_otlp(v: Option<&Value>) -> Self {
        let Some(v) = v else {
            return SpanStatus::Unset;
        };
        match v.get("code").and_then(Value::as_i64).unwrap_or(0) {
            1 => SpanStatus::Ok,
            2 => SpanStatus::Error(
                v.get("message").and_then(Value::as_str).map(String::from),
            ),
            _ => SpanStatus::Unset,
        }
    }
}

/// Primitive attribute value, mirroring the OTLP `AnyValue` subset used in
/// this trace format.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl AttrValue {
    fn to_otlp(&self) -> Value {
        match self {
            AttrValue::Str(s) => json!({"stringValue": s}),
            AttrValue::Int(i) => json!({"intValue": i.to_string()}),
            AttrValue::Double(d) => json!({"doubleValue": d}),
            AttrValue::Bool(b) => json!({"boolValue": b}),
        }
    }

    fn from_otlp(v: &Value) -> Option<Self> {
        if let Some(s) = v.get("stringValue").and_then(Value::as_str) {
            return Some(AttrValue::Str(s.to_string()));
        }
        if let Some(i) = v.get("intValue") {
            let parsed = match i {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            return parsed.map(AttrValue::Int);
        }
        if let Some(d) = v.get("doubleValue").and_then(Value::as_f64) {
            return Some(AttrValue::Double(d));
        }
        if let Some(b) = v.get("boolValue").and_then(Value::as_bool) {
            return Some(AttrValue::Bool(b));
        }
        None
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Double(d) => Some(*d),
            AttrValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}
impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}
impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}
impl From<u64> for AttrValue {
    fn from(i: u64) -> Self {
        AttrValue::Int(i as i64)
    }
}
impl From<f64> for AttrValue {
    fn from(d: f64) -> Self {
        AttrValue::Double(d)
    }
}
impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_unix_nano: u64,
    pub end_unix_nano: u64,
    pub attributes: Vec<(String, AttrValue)>,
    pub status: SpanStatus,
}

impl Span {
    /// Set or replace an attribute.
    pub fn set_attr(&mut self, key: &str, value: impl Into<AttrValue>) {
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.attributes.push((key.to_string(), value));
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn to_otlp_json(&self) -> Value {
        let attributes: Vec<Value> = self
            .attributes
            .iter()
            .map(|(k, v)| json!({"key": k, "value": v.to_otlp()}))
            .collect();
        let mut span = json!({
            "traceId": self.trace_id,
            "spanId": self.span_id,
            "name": self.name,
            "kind": self.kind.to_otlp(),
            "startTimeUnixNano": self.start_unix_nano.to_string(),
            "endTimeUnixNano": self.end_unix_nano.to_string(),
            "attributes": attributes,
            "status": self.status.to_otlp(),
        });
        if let Some(parent) = &self.parent_span_id {
            span["parentSpanId"] = json!(parent);
        }
        span
    }

    pub fn from_otlp_json(v: &Value) -> Option<Self> {
        let attributes = v
            .get("attributes")
            .and_then(Value::as_array)
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|a| {
                        let key = a.get("key")?.as_str()?.to_string();
                        let value = AttrValue::from_otlp(a.get("value")?)?;
                        Some((key, value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            trace_id: v.get("traceId")?.as_str()?.to_string(),
            span_id: v.get("spanId")?.as_str()?.to_string(),
            parent_span_id: v
                .get("parentSpanId")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
            name: v.get("name")?.as_str()?.to_string(),
            kind: SpanKind::from_otlp(v.get("kind").and_then(Value::as_i64).unwrap_or(1)),
            start_unix_nano: parse_nano(v.get("startTimeUnixNano"))?,
            end_unix_nano: parse_nano(v.get("endTimeUnixNano"))?,
            attributes,
            status: SpanStatus::from_otlp(v.get("status")),
        })
    }
}

fn parse_nano(v: Option<&Value>) -> Option<u64> {
    match v? {
        Value::String(s) => s.parse::<u64>().ok(),
        other => other.as_u64(),
    }
}

/// Current wall clock as nanoseconds since the Unix epoch.
pub fn now_unix_nano() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Random 64-bit span id (16 lowercase hex chars).
pub fn new_span_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Encode one batch of spans as a complete OTLP ResourceSpans document.
pub fn encode_batch(spans: &[Span]) -> Value {
    json!({
        "resourceSpans": [{
            "resource": {
                "attributes": [
                    {"key": "service.name", "value": {"stringValue": SERVICE_NAME}},
                ],
            },
            "scopeSpans": [{
                "scope": {"name": SCOPE_NAME, "version": env!("CARGO_PKG_VERSION")},
                "spans": spans.iter().map(Span::to_otlp_json).collect::<Vec<_>>(),
            }],
        }],
    })
}

/// Flatten every span out of an already-parsed OTLP document.
pub fn decode_batch_value(doc: &Value) -> Vec<Span> {
    let mut out = Vec::new();
    let Some(resource_spans) = doc.get("resourceSpans").and_then(Value::as_array) else {
        return out;
    };
    for rs in resource_spans {
        let Some(scope_spans) = rs.get("scopeSpans").and_then(Value::as_array) else {
            continue;
        };
        for ss in scope_spans {
            let Some(spans) = ss.get("spans").and_then(Value::as_array) else {
                continue;
            };
            out.extend(spans.iter().filter_map(Span::from_otlp_json));
        }
    }
    out
}

/// Parse one JSONL line into its spans. Returns None for malformed lines.
pub fn decode_batch(line: &str) -> Option<Vec<Span>> {
    let doc: Value = serde_json::from_str(line).ok()?;
    Some(decode_batch_value(&doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_span() -> Span {
        let mut span = Span {
            trace_id: "0123456789abcdef0123456789abcdef".into(),
            span_id: "0123456789abcdef".into(),
            parent_span_id: Some("fedcba9876543210".into()),
            name: "API POST /v1/messages".into(),
            kind: SpanKind::Client,
            start_unix_nano: 1_700_000_000_000_000_000,
            end_unix_nano: 1_700_000_001_500_000_000,
            attributes: Vec::new(),
            status: SpanStatus::Ok,
        };
        span.set_attr(ATTR_AI_MODEL, "claude-sonnet-4-5");
        span.set_attr(ATTR_AI_TOKENS_INPUT, 100i64);
        span.set_attr(ATTR_AI_COST_USD, 0.00105);
        span.set_attr(ATTR_AI_COST_KNOWN, true);
        span
    }

    #[test]
    fn otlp_roundtrip_preserves_all_attr_kinds() {
        let span = sample_span();
        let parsed = Span::from_otlp_json(&span.to_otlp_json()).expect("parse back");
        assert_eq!(parsed, span);
    }

    #[test]
    fn int_attrs_encode_as_strings() {
        let span = sample_span();
        let v = span.to_otlp_json();
        let attrs = v["attributes"].as_array().unwrap();
        let tokens = attrs
            .iter()
            .find(|a| a["key"] == ATTR_AI_TOKENS_INPUT)
            .unwrap();
        assert_eq!(tokens["value"]["intValue"], "100");
    }

    #[test]
    fn int_attrs_parse_from_number_or_string() {
        let as_num = json!({"intValue": 42});
        let as_str = json!({"intValue": "42"});
        assert_eq!(AttrValue::from_otlp(&as_num), Some(AttrValue::Int(42)));
        assert_eq!(AttrValue::from_otlp(&as_str), Some(AttrValue::Int(42)));
    }

    #[test]
    fn timestamps_are_decimal_strings() {
        let v = sample_span().to_otlp_json();
        assert_eq!(v["startTimeUnixNano"], "1700000000000000000");
        assert_eq!(v["endTimeUnixNano"], "1700000001500000000");
    }

    #[test]
    fn missing_parent_is_omitted_then_none() {
        let mut span = sample_span();
        span.parent_span_id = None;
        let v = span.to_otlp_json();
        assert!(v.get("parentSpanId").is_none());
        let parsed = Span::from_otlp_json(&v).unwrap();
        assert_eq!(parsed.parent_span_id, None);
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            SpanStatus::Unset,
            SpanStatus::Ok,
            SpanStatus::Error(None),
            SpanStatus::Error(Some("boom".into())),
        ] {
            let mut span = sample_span();
            span.status = status.clone();
            let parsed = Span::from_otlp_json(&span.to_otlp_json()).unwrap();
            assert_eq!(parsed.status, status);
        }
    }

    #[test]
    fn set_attr_replaces_existing_key() {
        let mut span = sample_span();
        span.set_attr(ATTR_AI_MODEL, "claude-haiku-4-5");
        let count = span
            .attributes
            .iter()
            .filter(|(k, _)| k == ATTR_AI_MODEL)
            .count();
        assert_eq!(count, 1);
        assert_eq!(
            span.attr(ATTR_AI_MODEL).and_then(AttrValue::as_str),
            Some("claude-haiku-4-5")
        );
    }

    #[test]
    fn encode_decode_batch() {
        let spans = vec![sample_span(), {
            let mut s = sample_span();
            s.span_id = "aaaaaaaaaaaaaaaa".into();
            s
        }];
        let doc = encode_batch(&spans);
        let line = serde_json::to_string(&doc).unwrap();
        let back = decode_batch(&line).unwrap();
        assert_eq!(back, spans);
    }

    #[test]
    fn decode_batch_rejects_garbage() {
        assert!(decode_batch("{not json").is_none());
        assert_eq!(decode_batch("{}").unwrap(), Vec::<Span>::new());
    }

    #[test]
    fn span_ids_are_16_hex_chars() {
        let id = new_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_span_id(), id);
    }
}
