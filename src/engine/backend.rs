//! Decode-engine seam.
//!
//! The session engine never touches tensors. Everything it needs from the
//! model runtime goes through [`DecodeEngine`]: tokenization, batch decode,
//! sampling, KV-cache sequence edits and the media encoder. Engines are
//! produced by an [`EngineLoader`] so the session can release and reload
//! them on `load`.

use std::path::Path;

use serde::Serialize;

use super::config::{SamplingConfig, SessionConfig};
use super::error::{DecodeError, EngineError};
use super::media::MediaChunk;
use super::template::ChatTurn;
use crate::memory::{KvSequence, TokenId};

/// Model facts reported by `load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub vocab_size: u32,
    /// Context length the model was trained with.
    pub n_ctx_train: u32,
    /// Context length of the live session (max_context).
    pub max_context: u32,
    /// Layer count + 1 (the output layer can be offloaded too).
    pub max_offload_layers: u32,
    /// A media projector is loaded.
    pub supports_media: bool,
}

/// Media encoded by the engine, ready to be decoded into the cache.
pub trait EncodedMedia {
    /// Placeholder tokens the encoder produced.
    fn n_tokens(&self) -> usize;
}

/// A loaded model with a live context, driven from a single thread.
pub trait DecodeEngine: KvSequence + Send {
    type Media: EncodedMedia;

    fn model_info(&self) -> ModelInfo;

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of one token; may be a partial UTF-8 sequence.
    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    /// End-of-sequence, end-of-turn and BOS ids.
    fn end_of_generation_ids(&self) -> Vec<TokenId>;

    /// Decode `tokens` at positions `start..start + tokens.len()`.
    ///
    /// Logits are requested for the last token only.
    fn decode_batch(&mut self, tokens: &[TokenId], start: usize) -> Result<(), DecodeError>;

    /// Sample from the logits of the last decoded token.
    fn sample(&mut self) -> TokenId;

    /// Feed a sampled token back into the sampler history.
    fn accept(&mut self, token: TokenId);

    fn reset_sampler(&mut self);

    /// Rebuild the sampler chain with new parameters.
    fn set_sampling(&mut self, sampling: &SamplingConfig);

    /// Render turns with the model's built-in chat template, generation
    /// prompt appended. None when the model has no usable template.
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Option<String>;

    fn supports_media(&self) -> bool;

    fn encode_media(&mut self, chunk: &MediaChunk) -> Result<Self::Media, EngineError>;

    /// Decode encoded media starting at `n_past`. Returns the new `n_past`.
    fn decode_media(&mut self, media: &Self::Media, n_past: usize) -> Result<usize, EngineError>;
}

/// Produces engines for a model file.
pub trait EngineLoader: Send {
    type Engine: DecodeEngine;

    fn load(&self, model_path: &Path, config: &SessionConfig) -> Result<Self::Engine, EngineError>;
}

/// Resolve the decode thread count. 0 = all logical cores, capped at 16.
pub fn resolve_threads(n: u32) -> i32 {
    if n == 0 {
        let optimal = num_cpus::get().clamp(1, 16);
        i32::try_from(optimal).unwrap_or(4)
    } else {
        i32::try_from(n).unwrap_or(4)
    }
}
