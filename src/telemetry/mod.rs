//! Telemetry module for EVA-CORE.
//!
//! Structured logging, per-predict spans, metrics and the host-facing
//! session event channel.

mod events;
mod logging;
pub mod metrics;
mod spans;

pub use events::{EventEmitter, ResetPath, SessionEvent};
pub use logging::{build_filter, init_logging, LogConfig, LogError, LogFormat, LOG_ENV};
pub use spans::{session_span, PredictSpan, SpanExt};
