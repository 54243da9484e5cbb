//! llama-cpp-2 backend for GGUF inference.
//!
//! One persistent `LlamaContext` per loaded model. The session drives it
//! position by position, so the KV cache survives between predicts and is
//! edited in place when the window overflows.

use std::mem::ManuallyDrop;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaLoraAdapter, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{DecodeError as LlamaDecodeError, TokenToStringError};

#[cfg(feature = "multimodal")]
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputChunks,
    MtmdInputText,
};

use crate::engine::backend::{resolve_threads, DecodeEngine, EncodedMedia, EngineLoader, ModelInfo};
use crate::engine::config::{SamplingConfig, SessionConfig};
use crate::engine::error::{DecodeError, EngineError};
use crate::engine::media::MediaChunk;
use crate::engine::template::ChatTurn;
use crate::memory::{CacheEditError, KvSequence, TokenId};

/// llama.cpp's "pick a random seed" value.
const RANDOM_SEED: u32 = 0xFFFF_FFFF;

/// Strength a LoRA adapter is applied with.
const LORA_SCALE: f32 = 1.0;

/// Initial piece buffer; grown when llama.cpp asks for more.
const PIECE_BUFFER: usize = 32;

static BACKEND: OnceLock<LlamaBackend> = OnceLock::new();
static BACKEND_INIT: Mutex<()> = Mutex::new(());

/// The process-wide llama.cpp backend. Initialised once.
fn backend() -> Result<&'static LlamaBackend, EngineError> {
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }
    let _lock = BACKEND_INIT
        .lock()
        .map_err(|_| EngineError::Context("backend init lock poisoned".into()))?;
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }
    let mut backend =
        LlamaBackend::init().map_err(|e| EngineError::Context(format!("backend init: {e}")))?;
    backend.void_logs();
    Ok(BACKEND.get_or_init(|| backend))
}

/// Loads GGUF files into [`LlamaEngine`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaLoader;

impl EngineLoader for LlamaLoader {
    type Engine = LlamaEngine;

    fn load(&self, model_path: &Path, config: &SessionConfig) -> Result<LlamaEngine, EngineError> {
        LlamaEngine::load(model_path, config)
    }
}

/// Media encoded by the projector.
pub struct LlamaMedia {
    #[cfg(feature = "multimodal")]
    chunks: MtmdInputChunks,
    n_tokens: usize,
}

impl EncodedMedia for LlamaMedia {
    fn n_tokens(&self) -> usize {
        self.n_tokens
    }
}

/// A loaded model plus its live context and sampler.
pub struct LlamaEngine {
    // Freed by hand in `Drop`, before the model it borrows.
    ctx: ManuallyDrop<LlamaContext<'static>>,
    #[cfg(feature = "multimodal")]
    mtmd: Option<MtmdContext>,
    model: &'static LlamaModel,
    // Freed after `ctx`, before `model`.
    lora: Option<LlamaLoraAdapter>,
    sampler: LlamaSampler,
    eog_ids: Vec<TokenId>,
    n_ctx: u32,
    n_batch: u32,
}

// SAFETY: the context and sampler hold raw llama.cpp pointers that are only
// touched through `&mut self`; the engine is moved between threads but never
// used from two at once.
unsafe impl Send for LlamaEngine {}

impl LlamaEngine {
    /// Load a GGUF model and create its context.
    pub fn load(path: &Path, config: &SessionConfig) -> Result<Self, EngineError> {
        let backend = backend()?;
        let load_err = |reason: String| EngineError::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };

        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| load_err(e.to_string()))?;
        let model: &'static LlamaModel = Box::leak(Box::new(model));

        let n_threads = resolve_threads(config.n_threads);
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.n_ctx))
            .with_n_batch(config.n_batch)
            .with_n_ubatch(config.n_ubatch)
            .with_n_threads(n_threads)
            .with_n_threads_batch(n_threads);
        let ctx = match model.new_context(backend, params) {
            Ok(ctx) => ctx,
            Err(e) => {
                // SAFETY: `model` was leaked above and nothing borrows it yet.
                unsafe { free_model(model) };
                return Err(EngineError::Context(e.to_string()));
            }
        };

        let lora = match &config.lora_path {
            Some(lora_path) => match attach_lora(lora_path, model, &ctx) {
                Ok(adapter) => Some(adapter),
                Err(e) => {
                    drop(ctx);
                    // SAFETY: the only borrower, `ctx`, was dropped above.
                    unsafe { free_model(model) };
                    return Err(e);
                }
            },
            None => None,
        };

        #[cfg(feature = "multimodal")]
        let mtmd = match &config.mmproj_path {
            Some(mmproj) => match load_projector(mmproj, model, n_threads) {
                Ok(mtmd) => Some(mtmd),
                Err(e) => {
                    drop(ctx);
                    drop(lora);
                    // SAFETY: the borrowers, `ctx` and `lora`, were dropped above.
                    unsafe { free_model(model) };
                    return Err(e);
                }
            },
            None => None,
        };
        #[cfg(not(feature = "multimodal"))]
        if config.mmproj_path.is_some() {
            tracing::warn!("mmproj set but built without multimodal support, ignoring");
        }

        tracing::debug!(
            path = %path.display(),
            n_ctx = config.n_ctx,
            n_threads,
            n_gpu_layers = config.n_gpu_layers,
            lora = lora.is_some(),
            "llama context created"
        );

        let mut eog_ids = vec![model.token_eos().0, model.token_bos().0];
        eog_ids.extend(
            (0..model.n_vocab())
                .map(LlamaToken)
                .filter(|&t| model.is_eog_token(t))
                .map(|t| t.0),
        );
        eog_ids.sort_unstable();
        eog_ids.dedup();

        Ok(Self {
            ctx: ManuallyDrop::new(ctx),
            #[cfg(feature = "multimodal")]
            mtmd,
            model,
            lora,
            sampler: build_sampler(&config.sampling),
            eog_ids,
            n_ctx: config.n_ctx,
            n_batch: config.n_batch,
        })
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        #[cfg(feature = "multimodal")]
        drop(self.mtmd.take());
        // SAFETY: `ctx` is not touched again after this point. `model` came
        // from `Box::leak` in `load` and its borrowers are gone.
        unsafe {
            ManuallyDrop::drop(&mut self.ctx);
            drop(self.lora.take());
            free_model(self.model);
        }
    }
}

/// # Safety
/// `model` must come from `Box::leak` and have no live borrowers.
unsafe fn free_model(model: &'static LlamaModel) {
    drop(Box::from_raw(model as *const LlamaModel as *mut LlamaModel));
}

#[cfg(feature = "multimodal")]
fn attach_lora(
    path: &Path,
    model: &LlamaModel,
    ctx: &LlamaContext<'_>,
) -> Result<LlamaLoraAdapter, EngineError> {
    let lora_err = |reason: String| EngineError::ModelLoad {
        path: path.to_path_buf(),
        reason,
    };
    let mut adapter = model
        .lora_adapter_init(path)
        .map_err(|e| lora_err(format!("lora adapter: {e}")))?;
    ctx.lora_adapter_set(&mut adapter, LORA_SCALE)
        .map_err(|e| lora_err(format!("lora adapter: {e}")))?;
    tracing::info!(path = %path.display(), scale = LORA_SCALE, "lora adapter applied");
    Ok(adapter)
}

fn load_projector(
    mmproj: &Path,
    model: &LlamaModel,
    n_threads: i32,
) -> Result<MtmdContext, EngineError> {
    let path = mmproj
        .to_str()
        .ok_or_else(|| EngineError::Media(format!("non-utf8 path {}", mmproj.display())))?;
    let params = MtmdContextParams {
        n_threads,
        ..MtmdContextParams::default()
    };
    MtmdContext::init_from_file(path, model, &params)
        .map_err(|e| EngineError::Media(format!("projector {}: {e}", mmproj.display())))
}

fn edit_err(op: &'static str, from: usize, to: Option<usize>, reason: impl ToString) -> CacheEditError {
    CacheEditError {
        op,
        from,
        to,
        reason: reason.to_string(),
    }
}

fn pos(p: usize) -> u32 {
    u32::try_from(p).unwrap_or(u32::MAX)
}

impl KvSequence for LlamaEngine {
    fn seq_remove(&mut self, from: usize, to: Option<usize>) -> Result<(), CacheEditError> {
        match self
            .ctx
            .clear_kv_cache_seq(Some(0), Some(pos(from)), to.map(pos))
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(edit_err("remove", from, to, "partial removal refused")),
            Err(e) => Err(edit_err("remove", from, to, e)),
        }
    }

    fn seq_shift(&mut self, from: usize, to: usize, delta: isize) -> Result<(), CacheEditError> {
        let delta = i32::try_from(delta).map_err(|e| edit_err("shift", from, Some(to), e))?;
        self.ctx
            .kv_cache_seq_add(0, Some(pos(from)), Some(pos(to)), delta)
            .map_err(|e| edit_err("shift", from, Some(to), e))
    }

    fn seq_clear(&mut self) {
        self.ctx.clear_kv_cache();
    }
}

impl DecodeEngine for LlamaEngine {
    type Media = LlamaMedia;

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            vocab_size: u32::try_from(self.model.n_vocab()).unwrap_or(0),
            n_ctx_train: self.model.n_ctx_train(),
            max_context: self.n_ctx,
            max_offload_layers: self.model.n_layer() + 1,
            supports_media: self.supports_media(),
        }
    }

    // llama-cpp-2 always tokenizes with special-token parsing enabled.
    fn tokenize(&self, text: &str, add_bos: bool, _parse_special: bool) -> Result<Vec<TokenId>, EngineError> {
        let bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, bos)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        let detok_err = |reason: String| EngineError::Detokenize { token, reason };
        match self
            .model
            .token_to_piece_bytes(LlamaToken(token), PIECE_BUFFER, true, None)
        {
            Ok(bytes) => Ok(bytes),
            Err(TokenToStringError::InsufficientBufferSpace(needed)) => self
                .model
                .token_to_piece_bytes(LlamaToken(token), needed.unsigned_abs() as usize, true, None)
                .map_err(|e| detok_err(e.to_string())),
            Err(e) => Err(detok_err(e.to_string())),
        }
    }

    fn end_of_generation_ids(&self) -> Vec<TokenId> {
        self.eog_ids.clone()
    }

    fn decode_batch(&mut self, tokens: &[TokenId], start: usize) -> Result<(), DecodeError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            let p = i32::try_from(start + i).map_err(|e| DecodeError::Failed(e.to_string()))?;
            batch
                .add(LlamaToken(token), p, &[0], i == last)
                .map_err(|e| DecodeError::Failed(format!("batch: {e}")))?;
        }
        match self.ctx.decode(&mut batch) {
            Ok(()) => Ok(()),
            Err(LlamaDecodeError::NoKvCacheSlot) => Err(DecodeError::NoFreeSlot {
                batch: tokens.len(),
            }),
            Err(e) => Err(DecodeError::Failed(e.to_string())),
        }
    }

    fn sample(&mut self) -> TokenId {
        self.sampler.sample(&self.ctx, -1).0
    }

    fn accept(&mut self, token: TokenId) {
        self.sampler.accept(LlamaToken(token));
    }

    fn reset_sampler(&mut self) {
        self.sampler.reset();
    }

    fn set_sampling(&mut self, sampling: &SamplingConfig) {
        self.sampler = build_sampler(sampling);
    }

    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Option<String> {
        let template = self.model.chat_template(None).ok()?;
        let messages = turns
            .iter()
            .map(|t| LlamaChatMessage::new(t.role.clone(), t.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        match self.model.apply_chat_template(&template, &messages, true) {
            Ok(rendered) => Some(rendered),
            Err(e) => {
                tracing::debug!(error = %e, "model chat template failed to render");
                None
            }
        }
    }

    fn supports_media(&self) -> bool {
        #[cfg(feature = "multimodal")]
        {
            self.mtmd.is_some()
        }
        #[cfg(not(feature = "multimodal"))]
        {
            false
        }
    }

    #[cfg(feature = "multimodal")]
    fn encode_media(&mut self, chunk: &MediaChunk) -> Result<LlamaMedia, EngineError> {
        let mtmd = self
            .mtmd
            .as_ref()
            .ok_or_else(|| EngineError::Media("no projector loaded".into()))?;
        let path = chunk.source_path.to_str().ok_or_else(|| {
            EngineError::Media(format!("non-utf8 path {}", chunk.source_path.display()))
        })?;
        let bitmap = MtmdBitmap::from_file(mtmd, path)
            .map_err(|e| EngineError::Media(format!("bitmap: {e}")))?;
        let text = MtmdInputText {
            text: mtmd_default_marker().to_string(),
            add_special: false,
            parse_special: true,
        };
        let chunks = mtmd
            .tokenize(text, &[&bitmap])
            .map_err(|e| EngineError::Media(format!("encode: {e}")))?;
        let n_tokens = chunks.total_tokens();
        Ok(LlamaMedia { chunks, n_tokens })
    }

    #[cfg(not(feature = "multimodal"))]
    fn encode_media(&mut self, chunk: &MediaChunk) -> Result<LlamaMedia, EngineError> {
        Err(EngineError::Media(format!(
            "{}: built without multimodal support",
            chunk.source_path.display()
        )))
    }

    #[cfg(feature = "multimodal")]
    fn decode_media(&mut self, media: &LlamaMedia, n_past: usize) -> Result<usize, EngineError> {
        let mtmd = self
            .mtmd
            .as_ref()
            .ok_or_else(|| EngineError::Media("no projector loaded".into()))?;
        let start = i32::try_from(n_past).map_err(|e| EngineError::Media(e.to_string()))?;
        let n_batch = i32::try_from(self.n_batch).unwrap_or(i32::MAX);
        let after = media
            .chunks
            .eval_chunks(mtmd, &self.ctx, start, 0, n_batch, true)
            .map_err(|e| EngineError::Media(format!("decode: {e}")))?;
        usize::try_from(after).map_err(|e| EngineError::Media(e.to_string()))
    }

    #[cfg(not(feature = "multimodal"))]
    fn decode_media(&mut self, media: &LlamaMedia, _n_past: usize) -> Result<usize, EngineError> {
        Err(EngineError::Media(format!(
            "cannot decode {} media tokens: built without multimodal support",
            media.n_tokens
        )))
    }
}

fn build_sampler(config: &SamplingConfig) -> LlamaSampler {
    let mut s = Vec::new();
    if config.repetition_penalty > 1.0 {
        let last_n = i32::try_from(config.penalty_last_n).unwrap_or(64);
        s.push(LlamaSampler::penalties(last_n, config.repetition_penalty, 0.0, 0.0));
    }
    if config.temperature <= 0.0 {
        s.push(LlamaSampler::greedy());
        return LlamaSampler::chain_simple(s);
    }
    if config.top_k > 0 {
        s.push(LlamaSampler::top_k(i32::try_from(config.top_k).unwrap_or(i32::MAX)));
    }
    s.push(LlamaSampler::top_p(config.top_p, 1));
    s.push(LlamaSampler::temp(config.temperature));
    s.push(LlamaSampler::dist(config.seed.unwrap_or(RANDOM_SEED)));
    LlamaSampler::chain_simple(s)
}
