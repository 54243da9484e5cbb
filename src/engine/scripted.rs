//! Deterministic in-process decode engine.
//!
//! `ScriptedEngine` tokenizes by character (or by byte), "samples" tokens
//! from a script, and keeps its own per-position KV mirror so callers can
//! check that the session ledger matches what the engine holds. Slot
//! failures and media outcomes can be scripted. Used by the test-suite and
//! for dry runs without model weights.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use super::backend::{DecodeEngine, EncodedMedia, EngineLoader, ModelInfo};
use super::config::{SamplingConfig, SessionConfig};
use super::error::{DecodeError, EngineError};
use super::media::MediaChunk;
use super::template::ChatTurn;
use crate::memory::{CacheEditError, KvSequence, TokenId, FILLER_TOKEN, MEDIA_TOKEN};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const EOT: TokenId = 3;
const FIRST_PIECE: TokenId = 10;
const SPECIALS: [&str; 4] = ["<unk>", "<s>", "</s>", "<|eot|>"];

/// How text is cut into tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Char,
    Byte,
}

/// Chat template the engine pretends to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedTemplate {
    None,
    ChatMl,
}

/// A KV edit as the engine saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Remove { from: usize, to: Option<usize> },
    Shift { from: usize, to: usize, delta: isize },
    Clear,
}

/// Outcome of the next media call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaScript {
    Ok { tokens: usize, positions: usize },
    FailEncode,
    /// Writes `written` positions, then fails.
    FailDecode { written: usize },
}

#[derive(Debug, Clone)]
pub struct ScriptedMedia {
    tokens: usize,
    positions: usize,
}

impl EncodedMedia for ScriptedMedia {
    fn n_tokens(&self) -> usize {
        self.tokens
    }
}

#[derive(Debug, Clone, Default)]
struct Vocab {
    pieces: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, TokenId>,
}

impl Vocab {
    fn intern(&mut self, bytes: &[u8]) -> TokenId {
        if let Some(&id) = self.index.get(bytes) {
            return id;
        }
        let id = TokenId::try_from(self.pieces.len()).unwrap_or(TokenId::MAX);
        self.pieces.push(bytes.to_vec());
        self.index.insert(bytes.to_vec(), id);
        id
    }
}

/// Unknown pieces are added to the vocabulary as they are tokenized.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    granularity: Granularity,
    template: ScriptedTemplate,
    n_ctx: usize,
    supports_media: bool,
    vocab: RefCell<Vocab>,
    specials: Vec<String>,
    script: VecDeque<TokenId>,
    idle: TokenId,
    kv: Vec<TokenId>,
    ops: Vec<KvOp>,
    decodes: Vec<(usize, usize)>,
    accepted: Vec<TokenId>,
    sampler_resets: usize,
    sampling: SamplingConfig,
    lora: Option<PathBuf>,
    slot_failures: usize,
    media: VecDeque<MediaScript>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(Granularity::Char)
    }
}

impl ScriptedEngine {
    pub fn new(granularity: Granularity) -> Self {
        let mut engine = Self {
            granularity,
            template: ScriptedTemplate::None,
            n_ctx: 4096,
            supports_media: false,
            vocab: RefCell::new(Vocab::default()),
            specials: Vec::new(),
            script: VecDeque::new(),
            idle: 0,
            kv: Vec::new(),
            ops: Vec::new(),
            decodes: Vec::new(),
            accepted: Vec::new(),
            sampler_resets: 0,
            sampling: SamplingConfig::default(),
            lora: None,
            slot_failures: 0,
            media: VecDeque::new(),
        };
        {
            let vocab = engine.vocab.get_mut();
            for special in SPECIALS {
                vocab.pieces.push(special.as_bytes().to_vec());
            }
            while vocab.pieces.len() < FIRST_PIECE as usize {
                vocab.pieces.push(b"<reserved>".to_vec());
            }
        }
        engine.idle = engine.intern(b"x");
        engine
    }

    pub fn with_template(mut self, template: ScriptedTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_media_support(mut self) -> Self {
        self.supports_media = true;
        self
    }

    /// Register a string tokenized as a single id when special parsing is on.
    pub fn with_special(mut self, text: &str) -> Self {
        self.intern(text.as_bytes());
        self.specials.push(text.to_owned());
        self
    }

    /// Queue whole pieces as sampled tokens, one id per piece.
    pub fn script_pieces(&mut self, pieces: &[&str]) -> &mut Self {
        for piece in pieces {
            let id = self.intern(piece.as_bytes());
            self.script.push_back(id);
        }
        self
    }

    /// Queue sampled tokens from raw byte pieces.
    pub fn script_bytes(&mut self, pieces: &[&[u8]]) -> &mut Self {
        for piece in pieces {
            let id = self.intern(piece);
            self.script.push_back(id);
        }
        self
    }

    pub fn script_token(&mut self, token: TokenId) -> &mut Self {
        self.script.push_back(token);
        self
    }

    /// Fail the next `n` batch decodes with "no free slot".
    pub fn fail_slots(&mut self, n: usize) -> &mut Self {
        self.slot_failures += n;
        self
    }

    pub fn script_media(&mut self, outcome: MediaScript) -> &mut Self {
        self.media.push_back(outcome);
        self
    }

    /// Token ids per KV position; holes left by retries read as fillers.
    pub fn kv_tokens(&self) -> &[TokenId] {
        &self.kv
    }

    pub fn kv_ops(&self) -> &[KvOp] {
        &self.ops
    }

    /// `(start, len)` of every successful batch decode.
    pub fn decode_calls(&self) -> &[(usize, usize)] {
        &self.decodes
    }

    pub fn accepted(&self) -> &[TokenId] {
        &self.accepted
    }

    pub fn sampler_resets(&self) -> usize {
        self.sampler_resets
    }

    /// Adapter the engine was loaded with.
    pub fn lora_path(&self) -> Option<&Path> {
        self.lora.as_deref()
    }

    /// Sampler parameters last handed to the engine.
    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn idle_token(&self) -> TokenId {
        self.idle
    }

    /// Id of a piece, adding it to the vocabulary if unseen.
    pub fn intern(&self, bytes: &[u8]) -> TokenId {
        self.vocab.borrow_mut().intern(bytes)
    }

    fn edit_error(op: &'static str, from: usize, to: Option<usize>, reason: &str) -> CacheEditError {
        CacheEditError {
            op,
            from,
            to,
            reason: reason.to_owned(),
        }
    }
}

impl KvSequence for ScriptedEngine {
    fn seq_remove(&mut self, from: usize, to: Option<usize>) -> Result<(), CacheEditError> {
        self.ops.push(KvOp::Remove { from, to });
        let end = to.unwrap_or(self.kv.len()).min(self.kv.len());
        if from > end {
            return Err(Self::edit_error("remove", from, to, "range past end"));
        }
        self.kv.drain(from..end);
        Ok(())
    }

    fn seq_shift(&mut self, from: usize, to: usize, delta: isize) -> Result<(), CacheEditError> {
        // remove already collapsed the mirror; only the bookkeeping remains
        self.ops.push(KvOp::Shift { from, to, delta });
        if delta > 0 {
            return Err(Self::edit_error("shift", from, Some(to), "forward shift unsupported"));
        }
        Ok(())
    }

    fn seq_clear(&mut self) {
        self.ops.push(KvOp::Clear);
        self.kv.clear();
    }
}

impl DecodeEngine for ScriptedEngine {
    type Media = ScriptedMedia;

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            vocab_size: u32::try_from(self.vocab.borrow().pieces.len()).unwrap_or(u32::MAX),
            n_ctx_train: 8192,
            max_context: u32::try_from(self.n_ctx).unwrap_or(u32::MAX),
            max_offload_layers: 33,
            supports_media: self.supports_media,
        }
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, EngineError> {
        let mut out = Vec::new();
        if add_bos {
            out.push(BOS);
        }
        let mut rest = text;
        while !rest.is_empty() {
            if parse_special {
                if let Some(special) = self.specials.iter().find(|s| rest.starts_with(s.as_str())) {
                    out.push(self.intern(special.as_bytes()));
                    rest = &rest[special.len()..];
                    continue;
                }
            }
            let Some(c) = rest.chars().next() else { break };
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            match self.granularity {
                Granularity::Char => out.push(self.intern(encoded)),
                Granularity::Byte => {
                    for b in encoded {
                        out.push(self.intern(std::slice::from_ref(b)));
                    }
                }
            }
            rest = &rest[c.len_utf8()..];
        }
        Ok(out)
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.vocab.borrow().pieces.get(i).cloned())
            .ok_or_else(|| EngineError::Detokenize {
                token,
                reason: "id out of range".into(),
            })
    }

    fn end_of_generation_ids(&self) -> Vec<TokenId> {
        vec![EOS, EOT, BOS]
    }

    fn decode_batch(&mut self, tokens: &[TokenId], start: usize) -> Result<(), DecodeError> {
        if self.slot_failures > 0 {
            self.slot_failures -= 1;
            return Err(DecodeError::NoFreeSlot {
                batch: tokens.len(),
            });
        }
        if start < self.kv.len() {
            return Err(DecodeError::Failed(format!(
                "position {start} already occupied (kv holds {})",
                self.kv.len()
            )));
        }
        if start + tokens.len() > self.n_ctx {
            return Err(DecodeError::Failed(format!(
                "batch [{start}, {}) exceeds n_ctx {}",
                start + tokens.len(),
                self.n_ctx
            )));
        }
        self.kv.resize(start, FILLER_TOKEN);
        self.kv.extend_from_slice(tokens);
        self.decodes.push((start, tokens.len()));
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        self.script.pop_front().unwrap_or(self.idle)
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.push(token);
    }

    fn reset_sampler(&mut self) {
        self.sampler_resets += 1;
        self.accepted.clear();
    }

    fn set_sampling(&mut self, sampling: &SamplingConfig) {
        self.sampling = sampling.clone();
    }

    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Option<String> {
        match self.template {
            ScriptedTemplate::None => None,
            ScriptedTemplate::ChatMl => {
                let mut out = String::new();
                for turn in turns {
                    out.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        turn.role, turn.content
                    ));
                }
                out.push_str("<|im_start|>assistant\n");
                Some(out)
            }
        }
    }

    fn supports_media(&self) -> bool {
        self.supports_media
    }

    fn encode_media(&mut self, chunk: &MediaChunk) -> Result<Self::Media, EngineError> {
        match self.media.front().copied() {
            Some(MediaScript::FailEncode) => {
                self.media.pop_front();
                Err(EngineError::Media(format!(
                    "cannot encode {}",
                    chunk.source_path.display()
                )))
            }
            Some(MediaScript::Ok { tokens, positions }) => Ok(ScriptedMedia { tokens, positions }),
            Some(MediaScript::FailDecode { written }) => Ok(ScriptedMedia {
                tokens: written + 1,
                positions: written + 1,
            }),
            None => Ok(ScriptedMedia {
                tokens: 16,
                positions: 16,
            }),
        }
    }

    fn decode_media(&mut self, media: &Self::Media, n_past: usize) -> Result<usize, EngineError> {
        let outcome = self.media.pop_front();
        self.kv.resize(n_past, FILLER_TOKEN);
        if let Some(MediaScript::FailDecode { written }) = outcome {
            self.kv.extend(std::iter::repeat(MEDIA_TOKEN).take(written));
            return Err(EngineError::Media("image decode failed".into()));
        }
        self.kv
            .extend(std::iter::repeat(MEDIA_TOKEN).take(media.positions));
        Ok(n_past + media.positions)
    }
}

/// Hands out copies of a prototype engine sized to the session config.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLoader {
    prototype: ScriptedEngine,
}

impl ScriptedLoader {
    pub fn new(prototype: ScriptedEngine) -> Self {
        Self { prototype }
    }

    pub fn prototype_mut(&mut self) -> &mut ScriptedEngine {
        &mut self.prototype
    }
}

impl EngineLoader for ScriptedLoader {
    type Engine = ScriptedEngine;

    fn load(&self, model_path: &Path, config: &SessionConfig) -> Result<ScriptedEngine, EngineError> {
        let mut engine = self.prototype.clone();
        engine.n_ctx = config.n_ctx as usize;
        engine.sampling = config.sampling.clone();
        if let Some(lora) = &config.lora_path {
            if !lora.is_file() {
                return Err(EngineError::ModelLoad {
                    path: lora.clone(),
                    reason: "lora adapter not found".into(),
                });
            }
            engine.lora = Some(lora.clone());
        }
        if config.mmproj_path.is_some() {
            engine.supports_media = true;
        }
        tracing::debug!(path = %model_path.display(), n_ctx = engine.n_ctx, "scripted engine loaded");
        Ok(engine)
    }
}
