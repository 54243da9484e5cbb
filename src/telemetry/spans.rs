//! Span utilities for session tracing.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for standardized predict spans.
pub struct PredictSpan;

impl PredictSpan {
    /// `finish_reason`, `tokens_generated` and `status` are recorded when the
    /// generation ends.
    pub fn new(session_id: &str, role: &str, n_past: usize) -> Span {
        info_span!(
            "predict",
            session_id = %session_id,
            role = %role,
            n_past = n_past,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            finish_reason = tracing::field::Empty,
            tokens_generated = tracing::field::Empty,
        )
    }
}

/// Span around `load` and `reset`.
pub fn session_span(op: &'static str, session_id: &str) -> Span {
    info_span!(
        "session",
        op = op,
        session_id = %session_id,
        status = tracing::field::Empty,
        error.message = tracing::field::Empty,
    )
}
