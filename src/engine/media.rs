//! Multimodal chunk injection.
//!
//! Media files are encoded by the engine's projector and decoded into the
//! KV cache in arrival order. Each occupied position gets a placeholder row
//! in the ledger. A chunk lives for one predict call; nothing about the
//! source bitmap is kept once it is encoded.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::backend::{DecodeEngine, EncodedMedia};
use crate::memory::{ContextWindow, Eviction, TokenCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    /// Classify by file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "bmp" | "gif" | "webp" | "tga" => Some(Self::Image),
            "wav" | "mp3" | "flac" => Some(Self::Audio),
            _ => None,
        }
    }

    /// Text shown for the chunk's rows in the ledger.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::Image => "<|image|>",
            Self::Audio => "<|audio|>",
        }
    }
}

/// One media input on its way into the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaChunk {
    pub kind: MediaKind,
    pub source_path: PathBuf,
    /// Set once the engine has encoded the chunk.
    pub encoded_token_count: usize,
}

impl MediaChunk {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, MediaFailure> {
        let source_path = path.into();
        let kind = MediaKind::from_path(&source_path).ok_or_else(|| MediaFailure {
            path: source_path.clone(),
            reason: "unrecognised media extension".into(),
        })?;
        if !source_path.is_file() {
            return Err(MediaFailure {
                path: source_path,
                reason: "file not found".into(),
            });
        }
        Ok(Self {
            kind,
            source_path,
            encoded_token_count: 0,
        })
    }
}

/// Why a chunk could not be injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// A chunk that made it into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injected {
    pub chunk: MediaChunk,
    /// Positions the chunk occupies; may differ from its token count.
    pub positions: usize,
    pub evictions: Vec<Eviction>,
}

/// Drives media through the engine for one predict call.
pub struct MediaInjector<'a, E: DecodeEngine> {
    engine: &'a mut E,
    cache: &'a mut TokenCache,
    window: ContextWindow,
    protected: usize,
}

impl<'a, E: DecodeEngine> MediaInjector<'a, E> {
    pub fn new(
        engine: &'a mut E,
        cache: &'a mut TokenCache,
        window: ContextWindow,
        protected: usize,
    ) -> Self {
        Self {
            engine,
            cache,
            window,
            protected,
        }
    }

    /// Encode and decode one chunk at `n_past`, advancing it.
    pub fn inject(
        &mut self,
        mut chunk: MediaChunk,
        n_past: &mut usize,
    ) -> Result<Injected, MediaFailure> {
        let fail = |path: &Path, reason: String| MediaFailure {
            path: path.to_path_buf(),
            reason,
        };

        let media = self
            .engine
            .encode_media(&chunk)
            .map_err(|e| fail(&chunk.source_path, e.to_string()))?;
        chunk.encoded_token_count = media.n_tokens();

        let max = self.window.max_batch(self.protected);
        if chunk.encoded_token_count > max {
            return Err(fail(
                &chunk.source_path,
                format!(
                    "chunk of {} tokens exceeds the {max} available",
                    chunk.encoded_token_count
                ),
            ));
        }

        let evictions = self
            .window
            .make_room(
                &mut *self.engine,
                self.cache,
                n_past,
                self.protected,
                chunk.encoded_token_count,
            )
            .map_err(|e| fail(&chunk.source_path, e.to_string()))?;

        let before = *n_past;
        let after = self
            .engine
            .decode_media(&media, before)
            .map_err(|e| fail(&chunk.source_path, e.to_string()))?;
        if after < before {
            return Err(fail(
                &chunk.source_path,
                format!("engine moved n_past backwards ({before} -> {after})"),
            ));
        }

        let positions = after - before;
        self.cache.push_media(positions, chunk.kind.placeholder());
        *n_past = after;
        tracing::debug!(
            path = %chunk.source_path.display(),
            tokens = chunk.encoded_token_count,
            positions,
            "media chunk injected"
        );

        Ok(Injected {
            chunk,
            positions,
            evictions,
        })
    }
}
