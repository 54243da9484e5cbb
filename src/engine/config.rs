//! Session configuration types for EVA-CORE.
//!
//! All fields have safe defaults. Configuration is validated before a
//! session is created and again whenever `Session::apply_config` swaps it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::SessionError;

/// Smallest context a session accepts.
pub const MIN_CONTEXT: u32 = 64;

/// Sampler chain parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy)
    pub temperature: f32,
    /// Top-k sampling limit (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling threshold (0.0–1.0]
    pub top_p: f32,
    /// Repetition penalty (1.0 = none)
    pub repetition_penalty: f32,
    /// Window the repetition penalty looks back over
    pub penalty_last_n: u32,
    /// Fixed sampler seed. None = random per load.
    pub seed: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            repetition_penalty: 1.2,
            penalty_last_n: 64,
            seed: None,
        }
    }
}

/// Open/close markers bracketing a reasoning block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkMarkers {
    pub open: String,
    pub close: String,
}

impl Default for ThinkMarkers {
    fn default() -> Self {
        Self {
            open: "<think>".into(),
            close: "</think>".into(),
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Context size (max_context)
    pub n_ctx: u32,
    /// Logical batch size for prompt decoding
    pub n_batch: u32,
    /// Physical micro-batch size
    pub n_ubatch: u32,
    /// Decode threads. 0 = auto
    pub n_threads: u32,
    /// Layers offloaded to the GPU
    pub n_gpu_layers: u32,
    /// Tokens sampled per predict. -1 = unbounded
    pub max_predict: i32,
    pub sampling: SamplingConfig,
    /// Multimodal projector; enables media input when set
    pub mmproj_path: Option<PathBuf>,
    /// LoRA adapter applied at full strength on load
    pub lora_path: Option<PathBuf>,
    /// Reasoning markers. None disables reasoning detection
    pub think_markers: Option<ThinkMarkers>,
    /// Stop when recent output contains both `<|` and `|>`
    pub halt_on_template_leak: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 2048,
            n_ubatch: 512,
            n_threads: 0,
            n_gpu_layers: 0,
            max_predict: 4096,
            sampling: SamplingConfig::default(),
            mmproj_path: None,
            lora_path: None,
            think_markers: Some(ThinkMarkers::default()),
            halt_on_template_leak: true,
        }
    }
}

impl SessionConfig {
    /// Validate configuration values. Returns error on invalid values.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.n_ctx < MIN_CONTEXT {
            return Err(SessionError::InvalidConfig(format!(
                "n_ctx must be >= {MIN_CONTEXT}"
            )));
        }
        if self.n_batch == 0 || self.n_ubatch == 0 {
            return Err(SessionError::InvalidConfig(
                "n_batch and n_ubatch must be > 0".into(),
            ));
        }
        if self.max_predict < -1 {
            return Err(SessionError::InvalidConfig(
                "max_predict must be -1 (unbounded) or >= 0".into(),
            ));
        }
        let s = &self.sampling;
        if !(0.0..=2.0).contains(&s.temperature) {
            return Err(SessionError::InvalidConfig(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if s.top_p <= 0.0 || s.top_p > 1.0 {
            return Err(SessionError::InvalidConfig(
                "top_p must be in range (0.0, 1.0]".into(),
            ));
        }
        if s.repetition_penalty < 1.0 {
            return Err(SessionError::InvalidConfig(
                "repetition_penalty must be >= 1.0".into(),
            ));
        }
        if let Some(m) = &self.think_markers {
            if m.open.is_empty() || m.close.is_empty() {
                return Err(SessionError::InvalidConfig(
                    "think markers must be non-empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether moving from `self` to `next` needs a fresh model and context.
    /// Everything else is picked up by a reset.
    pub fn requires_reload(&self, next: &SessionConfig) -> bool {
        self.n_ctx != next.n_ctx
            || self.n_batch != next.n_batch
            || self.n_ubatch != next.n_ubatch
            || self.n_threads != next.n_threads
            || self.n_gpu_layers != next.n_gpu_layers
            || self.mmproj_path != next.mmproj_path
            || self.lora_path != next.lora_path
    }

    /// Effective logical batch: never larger than the context.
    pub fn effective_batch(&self) -> usize {
        self.n_batch.min(self.n_ctx) as usize
    }

    /// Per-predict sampling bound. None = unbounded.
    pub fn predict_limit(&self) -> Option<u32> {
        u32::try_from(self.max_predict).ok()
    }

    /// Config for deterministic runs (greedy, fixed seed).
    pub fn deterministic() -> Self {
        Self {
            sampling: SamplingConfig {
                temperature: 0.0,
                top_k: 1,
                top_p: 1.0,
                repetition_penalty: 1.0,
                penalty_last_n: 0,
                seed: Some(0),
            },
            ..Self::default()
        }
    }
}
