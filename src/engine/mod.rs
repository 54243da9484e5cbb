//! Inference session engine for EVA-CORE.
//!
//! Drives a decode engine through load, reset and predict while keeping
//! the token ledger in step with the engine's KV cache. Provides the
//! `DecodeEngine` seam plus the scripted and llama.cpp implementations.

pub mod backend;
pub mod config;
pub mod error;
pub mod input;
pub mod output;
pub mod scripted;
pub mod stop;
pub mod template;
pub mod utf8;

#[cfg(feature = "gguf")]
pub mod gguf;

mod cancel;
mod generation;
mod media;
mod session;
mod streaming;

pub use backend::{resolve_threads, DecodeEngine, EncodedMedia, EngineLoader, ModelInfo};
pub use cancel::{GenerationGuard, StopHandle, StopResult};
pub use config::{SamplingConfig, SessionConfig, ThinkMarkers, MIN_CONTEXT};
pub use error::{DecodeError, EngineError, SessionError};
pub use generation::{Completion, DecodeTimer, Generation};
pub use input::{PredictInput, Role, MAX_MEDIA_PER_INPUT, MAX_TEXT_BYTES};
pub use media::{Injected, MediaChunk, MediaFailure, MediaInjector, MediaKind};
pub use output::{FinishReason, GenerationSummary, StreamChunk};
pub use scripted::{ScriptedEngine, ScriptedLoader};
pub use session::{ApplyOutcome, ResetOutcome, Session, SessionState, SessionStatus};
pub use stop::{ScanState, StopConfig, StopDetector, Verdict};
pub use streaming::{SharedSession, StreamingOutput, TokenStream};
pub use template::{
    ChatTemplateState, ChatTurn, Persona, TemplateFragments, FALLBACK_SYSTEM_PROMPT,
    OBSERVATION_STOPWORD,
};
pub use utf8::Utf8Reassembler;

#[cfg(feature = "gguf")]
pub use gguf::{LlamaEngine, LlamaLoader};
