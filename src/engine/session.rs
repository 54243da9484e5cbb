//! Session engine.
//!
//! A `Session` owns one loaded model, its live decode state and the token
//! ledger that mirrors the engine's KV cache. All cache mutation happens
//! through `&mut Session`, so the engine is only ever driven from the thread
//! that currently holds the session. The one cross-thread entry point is the
//! [`StopHandle`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use super::backend::{DecodeEngine, EngineLoader, ModelInfo};
use super::cancel::{GenerationGuard, StopHandle};
use super::config::SessionConfig;
use super::error::SessionError;
use super::generation::{DecodeTimer, Generation};
use super::input::{PredictInput, Role};
use super::media::{MediaChunk, MediaFailure, MediaInjector};
use super::stop::{StopConfig, StopDetector};
use super::template::{
    prefix_antiprompt, ChatTemplateState, TemplateFragments, FALLBACK_SYSTEM_PROMPT,
};
use super::utf8::Utf8Reassembler;
use crate::memory::{CacheEntry, ContextWindow, KvSequence, TokenCache, TokenId, BATCH_HEADROOM};
use crate::telemetry::{
    metrics, session_span, EventEmitter, PredictSpan, ResetPath, SessionEvent, SpanExt,
};

/// Coarse lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Unloaded,
    Loaded,
    Generating,
}

/// Decode counters and queues. `system_prefix_len <= n_past` always.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub n_past: usize,
    /// Input tokens queued since the last reset, system prefix included.
    pub n_consumed: usize,
    /// Tokens not yet pushed into the engine.
    pub pending_input_tokens: Vec<TokenId>,
    pub system_prefix_len: usize,
    pub is_generating: bool,
    pub think_mode: bool,
}

impl SessionState {
    /// Queue input for the engine.
    pub(crate) fn queue_input(&mut self, tokens: &[TokenId]) {
        self.pending_input_tokens.extend_from_slice(tokens);
        self.n_consumed += tokens.len();
    }
}

/// What a reset did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub path: ResetPath,
    pub system_prefix_len: usize,
    pub system_prompt_truncated: bool,
}

/// What `apply_config` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ApplyOutcome {
    Unchanged,
    /// No model is loaded; the config is used by the next `load`.
    Stored,
    /// Sampling or stop settings changed; the session was reset.
    Reset(ResetOutcome),
    /// Context, threads, offload or adapters changed; the model was reloaded.
    Reloaded(ModelInfo),
}

/// Whether a decode run finished its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Done,
    /// A stop arrived while retrying a slot failure; the rest of the queue
    /// was dropped.
    Interrupted,
}

/// Mutable decode state, kept apart from the engine so both can be
/// borrowed at once.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub(crate) state: SessionState,
    pub(crate) cache: TokenCache,
    pub(crate) window: ContextWindow,
    pub(crate) utf8: Utf8Reassembler,
    pub(crate) events: EventEmitter,
    n_batch: usize,
}

impl SessionCore {
    fn new(config: &SessionConfig) -> Self {
        Self {
            state: SessionState::default(),
            cache: TokenCache::with_capacity(config.n_ctx as usize),
            window: ContextWindow::new(config.n_ctx as usize),
            utf8: Utf8Reassembler::new(),
            events: EventEmitter::new(),
            n_batch: config.effective_batch(),
        }
    }

    /// Resize for a new config. Only valid while nothing is decoded.
    fn reconfigure(&mut self, config: &SessionConfig) {
        self.cache = TokenCache::with_capacity(config.n_ctx as usize);
        self.window = ContextWindow::new(config.n_ctx as usize);
        self.n_batch = config.effective_batch();
        self.state = SessionState::default();
        self.utf8.discard();
    }

    fn clear(&mut self) {
        self.state = SessionState::default();
        self.cache.clear();
        self.utf8.discard();
    }

    pub(crate) fn publish_cache(&mut self) {
        let n_ctx = self.window.n_ctx();
        let percent = self.cache.fill_percent(n_ctx);
        let n_past = self.state.n_past;
        let cache = &self.cache;
        self.events
            .emit_with(|| SessionEvent::CacheSnapshot(cache.snapshot()));
        self.events.emit(SessionEvent::CacheFill {
            percent,
            n_past,
            n_ctx,
        });
        metrics::record_cache_fill(percent);
    }

    /// Evict until `pending` tokens fit after `n_past`.
    pub(crate) fn ensure_room<E: DecodeEngine>(
        &mut self,
        engine: &mut E,
        pending: usize,
    ) -> Result<(), SessionError> {
        let rounds = self.window.make_room(
            engine,
            &mut self.cache,
            &mut self.state.n_past,
            self.state.system_prefix_len,
            pending,
        )?;
        for round in rounds {
            tracing::info!(
                discarded = round.discarded,
                n_past = round.n_past_after,
                "context full, discarded oldest half"
            );
            metrics::record_truncation(round.discarded);
            self.events.emit(SessionEvent::Truncated {
                discarded: round.discarded,
            });
        }
        Ok(())
    }

    /// Push the pending queue through the engine in `n_batch` chunks.
    ///
    /// A "no free slot" failure is answered with a filler row and a retry of
    /// the same batch; there is no retry cap.
    pub(crate) fn decode_pending<E: DecodeEngine>(
        &mut self,
        engine: &mut E,
        timer: &mut DecodeTimer,
        stop: Option<&StopHandle>,
    ) -> Result<Flow, SessionError> {
        let mut pending = std::mem::take(&mut self.state.pending_input_tokens);
        if pending.is_empty() {
            return Ok(Flow::Done);
        }

        let skipped = self
            .window
            .clamp_pending(&mut pending, self.state.system_prefix_len);
        if skipped > 0 {
            tracing::warn!(
                skipped,
                kept = pending.len(),
                "input longer than the context window, tail dropped"
            );
            self.events.emit(SessionEvent::InputTrimmed { skipped });
        }
        self.ensure_room(engine, pending.len())?;

        let mut offset = 0;
        while offset < pending.len() {
            let n_eval = self.n_batch.min(pending.len() - offset);
            let batch = &pending[offset..offset + n_eval];
            let texts = batch
                .iter()
                .map(|&t| {
                    engine
                        .detokenize(t)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                })
                .collect::<Result<Vec<_>, _>>()?;

            let started = Instant::now();
            match engine.decode_batch(batch, self.state.n_past) {
                Ok(()) => {
                    timer.record(n_eval, started.elapsed());
                    metrics::record_decode(n_eval, n_eval > 1);
                    for (&token, text) in batch.iter().zip(texts) {
                        self.cache.push(token, text);
                    }
                    self.state.n_past += n_eval;
                    offset += n_eval;
                    self.publish_cache();
                }
                Err(super::error::DecodeError::NoFreeSlot { batch }) => {
                    if stop.is_some_and(StopHandle::is_requested) {
                        tracing::debug!(dropped = pending.len() - offset, "stop during slot retry");
                        return Ok(Flow::Interrupted);
                    }
                    self.cache.push_filler();
                    self.state.n_past += 1;
                    tracing::warn!(
                        batch,
                        n_past = self.state.n_past,
                        "no free kv slot, inserted filler and retrying"
                    );
                    metrics::record_filler();
                    self.events.emit(SessionEvent::FillerInserted {
                        n_past: self.state.n_past,
                    });
                    self.ensure_room(engine, pending.len() - offset)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Flow::Done)
    }
}

/// A single-model inference session.
pub struct Session<L: EngineLoader> {
    id: Uuid,
    loader: L,
    config: SessionConfig,
    pub(crate) engine: Option<L::Engine>,
    model_info: Option<ModelInfo>,
    model_path: Option<PathBuf>,
    pub(crate) core: SessionCore,
    template: ChatTemplateState,
    fragments: Option<TemplateFragments>,
    antiprompts: Vec<String>,
    /// `antiprompts[0]` is the lowercased input prefix.
    pub(crate) prefix_stop: bool,
    system_prompt_truncated: bool,
    /// System prompt text currently decoded in the engine, and whether it
    /// was decoded for completion mode.
    decoded_prompt: Option<(bool, String)>,
    pub(crate) skip_next_prefix: bool,
    pub(crate) stop: StopHandle,
}

impl<L: EngineLoader> Session<L> {
    pub fn new(loader: L, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            loader,
            core: SessionCore::new(&config),
            config,
            engine: None,
            model_info: None,
            model_path: None,
            template: ChatTemplateState::default(),
            fragments: None,
            antiprompts: Vec::new(),
            prefix_stop: false,
            system_prompt_truncated: false,
            decoded_prompt: None,
            skip_next_prefix: false,
            stop: StopHandle::new(),
        })
    }

    /// Set the template used by the reset that `load` performs.
    pub fn with_template(mut self, template: ChatTemplateState) -> Self {
        self.template = template;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        if self.engine.is_none() {
            SessionStatus::Unloaded
        } else if self.stop.is_generating() {
            SessionStatus::Generating
        } else {
            SessionStatus::Loaded
        }
    }

    pub fn model_info(&self) -> Option<&ModelInfo> {
        self.model_info.as_ref()
    }

    /// The loaded engine, for inspection.
    pub fn engine(&self) -> Option<&L::Engine> {
        self.engine.as_ref()
    }

    /// Mutable engine access, for scripting test engines between predicts.
    /// Edits made here bypass the ledger.
    pub fn engine_mut(&mut self) -> Option<&mut L::Engine> {
        self.engine.as_mut()
    }

    /// Receive session events. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Handle for stopping generations from other threads.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request cancellation of the in-flight predict.
    pub fn stop(&self) {
        self.stop.request();
    }

    pub fn cache_snapshot(&self) -> Vec<CacheEntry> {
        self.core.cache.snapshot()
    }

    /// The ledger as a JSON array of `{position, token_id, text}` rows.
    pub fn cache_json(&self) -> Result<String, serde_json::Error> {
        self.core.cache.to_json()
    }

    pub fn cache_fill_percent(&self) -> f32 {
        self.core.cache.fill_percent(self.core.window.n_ctx())
    }

    /// Copy of the decode counters.
    pub fn state(&self) -> SessionState {
        SessionState {
            is_generating: self.stop.is_generating(),
            ..self.core.state.clone()
        }
    }

    pub fn fragments(&self) -> Option<&TemplateFragments> {
        self.fragments.as_ref()
    }

    pub fn template(&self) -> &ChatTemplateState {
        &self.template
    }

    pub fn antiprompts(&self) -> &[String] {
        &self.antiprompts
    }

    pub fn system_prompt_truncated(&self) -> bool {
        self.system_prompt_truncated
    }

    /// Every vocabulary entry as `(id, lossy text)`.
    pub fn vocabulary(&self) -> Result<Vec<(TokenId, String)>, SessionError> {
        let engine = self.engine.as_ref().ok_or(SessionError::NotLoaded)?;
        let n_vocab = TokenId::try_from(engine.model_info().vocab_size).unwrap_or(TokenId::MAX);
        (0..n_vocab)
            .map(|id| {
                let bytes = engine.detokenize(id)?;
                Ok((id, String::from_utf8_lossy(&bytes).into_owned()))
            })
            .collect()
    }

    /// Release the current model (if any), load `model_path` and reset.
    pub fn load(&mut self, model_path: impl AsRef<Path>) -> Result<ModelInfo, SessionError> {
        let path = model_path.as_ref();
        if self.stop.is_generating() {
            return Err(SessionError::Busy);
        }
        let span = session_span("load", &self.id.to_string());
        let _enter = span.enter();

        let result = self.load_inner(path);
        span.record_result(&result);
        result
    }

    fn load_inner(&mut self, path: &Path) -> Result<ModelInfo, SessionError> {
        self.unload();
        if !path.is_file() {
            tracing::error!(path = %path.display(), "model file not found");
            return Err(SessionError::ModelNotFound(path.to_path_buf()));
        }

        let engine = self
            .loader
            .load(path, &self.config)
            .map_err(SessionError::Load)?;
        let info = engine.model_info();
        self.engine = Some(engine);
        self.model_info = Some(info.clone());
        self.model_path = Some(path.to_path_buf());

        let template = self.template.clone();
        if let Err(e) = self.reset_inner(&template) {
            self.unload();
            return Err(e);
        }

        tracing::info!(
            path = %path.display(),
            vocab_size = info.vocab_size,
            n_ctx_train = info.n_ctx_train,
            max_offload_layers = info.max_offload_layers,
            supports_media = info.supports_media,
            "model loaded"
        );
        Ok(info)
    }

    /// Drop the engine and forget all decode state.
    pub fn unload(&mut self) {
        if self.engine.take().is_some() {
            tracing::info!("model released");
        }
        self.model_info = None;
        self.model_path = None;
        self.core.clear();
        self.decoded_prompt = None;
        self.skip_next_prefix = false;
        self.core.publish_cache();
    }

    /// Swap in new settings.
    ///
    /// Changes to the context size, batch sizes, threads, GPU offload,
    /// projector or LoRA adapter reload the current model. Anything else
    /// (sampling, `max_predict`, stop settings) rebuilds the sampler and
    /// resets the session.
    pub fn apply_config(&mut self, config: SessionConfig) -> Result<ApplyOutcome, SessionError> {
        config.validate()?;
        if self.stop.is_generating() {
            return Err(SessionError::Busy);
        }
        if config == self.config {
            return Ok(ApplyOutcome::Unchanged);
        }
        let reload = self.config.requires_reload(&config);
        self.config = config;

        let path = match (&self.engine, &self.model_path) {
            (Some(_), Some(path)) => path.clone(),
            _ => {
                self.core.reconfigure(&self.config);
                return Ok(ApplyOutcome::Stored);
            }
        };

        let span = session_span("apply_config", &self.id.to_string());
        let _enter = span.enter();
        let result = if reload {
            tracing::info!(path = %path.display(), "settings need a new context, reloading");
            self.unload();
            self.core.reconfigure(&self.config);
            self.load_inner(&path).map(ApplyOutcome::Reloaded)
        } else {
            if let Some(engine) = self.engine.as_mut() {
                engine.set_sampling(&self.config.sampling);
            }
            let template = self.template.clone();
            self.reset_inner(&template).map(ApplyOutcome::Reset)
        };
        span.record_result(&result);
        result
    }

    /// Rebuild the system prefix from `template`.
    pub fn reset(&mut self, template: &ChatTemplateState) -> Result<ResetOutcome, SessionError> {
        if self.stop.is_generating() {
            return Err(SessionError::Busy);
        }
        let span = session_span("reset", &self.id.to_string());
        let _enter = span.enter();

        let result = self.reset_inner(template);
        span.record_result(&result);
        result
    }

    fn reset_inner(&mut self, template: &ChatTemplateState) -> Result<ResetOutcome, SessionError> {
        let engine = self.engine.as_mut().ok_or(SessionError::NotLoaded)?;
        let core = &mut self.core;

        let fragments = template.resolve(|turns| engine.apply_chat_template(turns));
        let mut system_text = if template.completion_mode {
            String::new()
        } else {
            fragments.system_prompt.clone()
        };
        // BOS always opens the protected prefix, even with no system text
        let mut tokens = engine.tokenize(&system_text, true, true)?;

        let limit = core.window.n_ctx().saturating_sub(BATCH_HEADROOM);
        let truncated = tokens.len() > limit;
        if truncated {
            tracing::warn!(
                tokens = tokens.len(),
                limit,
                "system prompt too long, using fallback"
            );
            system_text = FALLBACK_SYSTEM_PROMPT.to_owned();
            tokens = engine.tokenize(&system_text, true, true)?;
        }

        engine.reset_sampler();
        core.utf8.discard();
        core.state.pending_input_tokens.clear();

        let full = self
            .decoded_prompt
            .as_ref()
            .map_or(true, |(completion, text)| {
                *completion != template.completion_mode || *text != system_text
            });
        let path = if full {
            self.decoded_prompt = None;
            engine.seq_clear();
            core.cache.clear();
            core.state = SessionState::default();
            core.state.queue_input(&tokens);
            let mut timer = DecodeTimer::default();
            core.decode_pending(engine, &mut timer, None)?;
            core.state.system_prefix_len = core.state.n_past;
            self.decoded_prompt = Some((template.completion_mode, system_text));
            ResetPath::Full
        } else {
            let keep = core.state.system_prefix_len;
            if core.state.n_past > keep {
                engine.seq_remove(keep, None)?;
                core.cache.truncate(keep);
                core.state.n_past = keep;
            }
            core.state.n_consumed = tokens.len();
            ResetPath::Partial
        };
        core.state.think_mode = false;

        self.antiprompts = template.antiprompts(&fragments);
        self.prefix_stop = !template.completion_mode && prefix_antiprompt(&fragments).is_some();
        self.skip_next_prefix = false;
        self.system_prompt_truncated = truncated;
        self.fragments = Some(fragments);
        self.template = template.clone();

        let outcome = ResetOutcome {
            path,
            system_prefix_len: core.state.system_prefix_len,
            system_prompt_truncated: truncated,
        };
        tracing::info!(
            path = ?outcome.path,
            system_prefix_len = outcome.system_prefix_len,
            truncated,
            "session reset"
        );
        core.events.emit(SessionEvent::ResetCompleted {
            path,
            system_prefix_len: outcome.system_prefix_len,
            system_prompt_truncated: truncated,
        });
        core.publish_cache();
        Ok(outcome)
    }

    /// Queue `input` and start generating.
    ///
    /// The returned [`Generation`] is lazy: nothing is sampled until it is
    /// iterated. Dropping it finishes the generation as cancelled.
    pub fn predict(&mut self, input: PredictInput) -> Result<Generation<'_, L>, SessionError> {
        input.validate()?;
        if self.engine.is_none() {
            return Err(SessionError::NotLoaded);
        }
        let guard = self.stop.begin().ok_or(SessionError::Busy)?;
        self.predict_reserved(input, guard)
    }

    /// `predict` for a generation slot taken earlier with `StopHandle::begin`.
    /// A stop requested since the reservation is kept.
    pub(crate) fn predict_reserved(
        &mut self,
        input: PredictInput,
        guard: GenerationGuard,
    ) -> Result<Generation<'_, L>, SessionError> {
        input.validate()?;
        if self.engine.is_none() {
            return Err(SessionError::NotLoaded);
        }
        let span = PredictSpan::new(
            &self.id.to_string(),
            input.role.as_str(),
            self.core.state.n_past,
        );
        let mut timer = DecodeTimer::default();

        let result = span.in_scope(|| self.queue_turn(&input, &mut timer));
        if let Err(e) = &result {
            span.record_result(&result);
            tracing::warn!(parent: &span, error = %e, "predict rejected");
        }
        result?;

        let detector = StopDetector::new(self.stop_config())?;
        Ok(Generation::new(self, detector, guard, span, timer))
    }

    fn stop_config(&self) -> StopConfig {
        let completion = self.template.completion_mode;
        StopConfig {
            eos_ids: self
                .engine
                .as_ref()
                .map(|e| e.end_of_generation_ids().into_iter().collect())
                .unwrap_or_default(),
            antiprompts: self.antiprompts.clone(),
            max_predict: self.config.max_predict,
            think_markers: self.config.think_markers.clone(),
            halt_on_template_leak: self.config.halt_on_template_leak && !completion,
        }
    }

    /// Tokenize the turn, inject media, and leave the rest queued.
    fn queue_turn(&mut self, input: &PredictInput, timer: &mut DecodeTimer) -> Result<(), SessionError> {
        let engine = self.engine.as_mut().ok_or(SessionError::NotLoaded)?;

        let mut chunks = Vec::with_capacity(input.media_paths.len());
        if !input.media_paths.is_empty() {
            if !engine.supports_media() {
                return Err(SessionError::MediaUnsupported(
                    "no media projector loaded".into(),
                ));
            }
            for path in &input.media_paths {
                let chunk = MediaChunk::from_path(path).map_err(|f| SessionError::MediaDecode {
                    path: f.path,
                    reason: f.reason,
                })?;
                chunks.push(chunk);
            }
        }

        let completion = self.template.completion_mode;
        let fragments = self.fragments.clone().unwrap_or_else(|| {
            self.template.resolve(|turns| engine.apply_chat_template(turns))
        });
        let prefix = match (completion, input.role) {
            (true, _) => "",
            (false, Role::User) if self.skip_next_prefix => "",
            (false, Role::User) => fragments.input_prefix.as_str(),
            (false, Role::Tool) => fragments.tool_prefix.as_str(),
        };
        let suffix = if completion {
            ""
        } else {
            fragments.input_suffix.as_str()
        };
        self.skip_next_prefix = false;

        let prefix_tokens = if prefix.is_empty() {
            Vec::new()
        } else {
            engine.tokenize(prefix, false, true)?
        };
        let mut body_tokens = if input.text.is_empty() {
            Vec::new()
        } else {
            engine.tokenize(&input.text, false, false)?
        };
        if !suffix.is_empty() {
            body_tokens.extend(engine.tokenize(suffix, false, true)?);
        }

        self.core.state.queue_input(&prefix_tokens);

        if !chunks.is_empty() {
            self.core.decode_pending(engine, timer, None)?;
            for chunk in chunks {
                if let Err(failure) = self.inject(chunk) {
                    return Err(self.recover_from_media_failure(failure));
                }
            }
        }

        self.core.state.queue_input(&body_tokens);
        Ok(())
    }

    fn inject(&mut self, chunk: MediaChunk) -> Result<(), MediaFailure> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(MediaFailure {
                path: chunk.source_path,
                reason: "no model loaded".into(),
            });
        };
        let core = &mut self.core;
        let mut injector = MediaInjector::new(
            engine,
            &mut core.cache,
            core.window,
            core.state.system_prefix_len,
        );
        let injected = injector.inject(chunk, &mut core.state.n_past)?;
        for round in &injected.evictions {
            metrics::record_truncation(round.discarded);
            core.events.emit(SessionEvent::Truncated {
                discarded: round.discarded,
            });
        }
        core.publish_cache();
        Ok(())
    }

    /// Full reset after a half-applied media chunk; returns the error to report.
    fn recover_from_media_failure(&mut self, failure: MediaFailure) -> SessionError {
        tracing::warn!(
            path = %failure.path.display(),
            reason = %failure.reason,
            "media injection failed, resetting session"
        );
        metrics::record_media_failure();
        self.core.events.emit(SessionEvent::MediaDecodeFailed {
            reason: failure.reason.clone(),
        });

        self.decoded_prompt = None;
        let template = self.template.clone();
        if let Err(e) = self.reset_inner(&template) {
            tracing::error!(error = %e, "reset after media failure failed");
            return e;
        }
        SessionError::MediaDecode {
            path: failure.path,
            reason: failure.reason,
        }
    }
}
