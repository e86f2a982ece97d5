//! OTLP-compatible span model, attribute keys, and the JSONL writer.

pub mod keys;
pub mod span;
pub mod writer;

pub use keys::*;
pub use span::{AttrValue, Span, SpanKind, SpanStatus};
pub use writer::{OtlpWriter, SpanSink};
