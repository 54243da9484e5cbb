//! Session error types for EVA-CORE.
//!
//! Errors follow the session taxonomy: fatal load failures leave the session
//! unloaded, slot failures are retried inside the decode loop, media failures
//! trigger a full reset, and everything else is reported to the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::memory::{CacheEditError, ContextError};

/// Failures reported by a decode-engine collaborator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("Context creation failed: {0}")]
    Context(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Detokenization of token {token} failed: {reason}")]
    Detokenize { token: i32, reason: String },

    #[error("Media error: {0}")]
    Media(String),

    #[error(transparent)]
    CacheEdit(#[from] CacheEditError),
}

/// Outcome of a failed batch decode.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The engine found no KV slot for the batch. Retried with a filler row.
    #[error("No free KV slot for a batch of {batch} tokens")]
    NoFreeSlot { batch: usize },

    #[error("Decode failed: {0}")]
    Failed(String),
}

/// Errors surfaced by [`Session`](super::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Model load failed: {0}")]
    Load(#[source] EngineError),

    #[error("No model loaded")]
    NotLoaded,

    #[error("A generation is already in flight")]
    Busy,

    #[error("Input validation failed: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Media input not supported: {0}")]
    MediaUnsupported(String),

    #[error("Media decode failed for {path}: {reason}")]
    MediaDecode { path: PathBuf, reason: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl SessionError {
    /// Returns true if the session is left unloaded by this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ModelNotFound(_) | Self::Load(_))
    }

    /// Returns true if the session stays usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MediaDecode { .. }
                | Self::MediaUnsupported(_)
                | Self::InvalidInput(_)
                | Self::Busy
                | Self::Decode(DecodeError::NoFreeSlot { .. })
        )
    }

    /// Returns true if this error should be logged as a warning.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::MediaDecode { .. } | Self::MediaUnsupported(_) | Self::Busy
        )
    }
}

impl From<CacheEditError> for SessionError {
    fn from(err: CacheEditError) -> Self {
        Self::Engine(EngineError::CacheEdit(err))
    }
}
