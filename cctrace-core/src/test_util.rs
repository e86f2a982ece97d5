#![cfg(test)]

//! Test doubles shared across module tests.

use std::sync::Mutex;

use crate::otlp::span::Span;
use crate::otlp::writer::SpanSink;

/// Sink that keeps every exported batch in memory for assertions.
#[derive(Default)]
pub struct CaptureSink {
    batches: Mutex<Vec<Vec<Span>>>,
}

impl CaptureSink {
    /// All spans exported so far, flattened in export order.
    pub fn spans(&self) -> Vec<Span> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<Span> {
        self.spans().into_iter().find(|s| s.name == name)
    }
}

impl SpanSink for CaptureSink {
    fn export(&self, batch: &[Span]) {
        self.batches.lock().unwrap().push(batch.to_vec());
    }
}
