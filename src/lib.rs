//! EVA-CORE inference session engine
//!
//! Keeps a single model session alive across turns: a token ledger that
//! mirrors the decode engine's KV cache, discard-half context management,
//! UTF-8 safe streaming, multimodal injection, and stop detection with
//! reasoning-block awareness.
//!
//! # Layout
//!
//! - [`engine`]: session, generation loop, decode-engine seam and backends
//! - [`memory`]: token ledger and context window policy
//! - [`telemetry`]: logging, spans, metrics and host events
//! - [`config`]: environment and TOML configuration

pub mod config;
pub mod engine;
pub mod memory;
pub mod telemetry;

pub use engine::{
    ChatTemplateState, FinishReason, Generation, PredictInput, Session, SessionConfig,
    SessionError, StreamChunk,
};
pub use memory::{CacheEntry, TokenCache, TokenId};

/// Crate version, as reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
