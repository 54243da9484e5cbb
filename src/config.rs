//! Configuration loading from TOML files and environment variables.
//!
//! Values come from `SessionConfig::default()`, then an optional TOML file,
//! then `EVA_CORE_*` environment variables. Invalid environment values fall
//! back to what was there before without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `EVA_CORE_CONFIG` | unset | TOML file read by [`load`] |
//! | `EVA_CORE_N_CTX` | 4096 | Context window (tokens), floor 64 |
//! | `EVA_CORE_N_BATCH` | 2048 | Decode batch size |
//! | `EVA_CORE_N_UBATCH` | 512 | Physical micro-batch |
//! | `EVA_CORE_N_THREADS` | 0 | Decode threads (0 = auto) |
//! | `EVA_CORE_N_GPU_LAYERS` | 0 | Layers offloaded to the GPU |
//! | `EVA_CORE_N_PREDICT` | 4096 | Tokens per predict (-1 = unbounded) |
//! | `EVA_CORE_TEMP` | 0.7 | Sampling temperature |
//! | `EVA_CORE_TOP_K` | 40 | Top-k (0 = off) |
//! | `EVA_CORE_TOP_P` | 0.95 | Top-p |
//! | `EVA_CORE_REPEAT` | 1.2 | Repetition penalty |
//! | `EVA_CORE_SEED` | unset | Fixed sampler seed |
//! | `EVA_CORE_MMPROJ` | unset | Multimodal projector file |
//! | `EVA_CORE_LORA` | unset | LoRA adapter file |
//! | `EVA_CORE_LOG_FORMAT` | pretty | `json` or `pretty` |
//! | `EVA_CORE_LOG` | info | Log filter directive |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{SessionConfig, MIN_CONTEXT};
use crate::telemetry::{LogConfig, LogFormat};

/// Environment variable naming a default config file.
pub const CONFIG_ENV: &str = "EVA_CORE_CONFIG";

/// Everything the CLI and hosts configure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaConfig {
    pub session: SessionConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl EvaConfig {
    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.session
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(self)
    }
}

/// Parse an env var, returning `current` on missing or invalid.
fn parse_or<T: FromStr>(key: &str, current: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(current),
        Err(_) => current,
    }
}

/// Like [`parse_or`], raising a value read from the environment to `floor`.
/// `current` is returned untouched when the variable is absent or invalid.
fn parse_floor<T: FromStr + Ord>(key: &str, current: T, floor: T) -> T {
    match std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok()) {
        Some(val) => val.max(floor),
        None => current,
    }
}

/// Overlay `EVA_CORE_*` variables onto `config`.
pub fn apply_env(config: &mut EvaConfig) {
    let s = &mut config.session;
    s.n_ctx = parse_floor("EVA_CORE_N_CTX", s.n_ctx, MIN_CONTEXT);
    s.n_batch = parse_floor("EVA_CORE_N_BATCH", s.n_batch, 1);
    s.n_ubatch = parse_floor("EVA_CORE_N_UBATCH", s.n_ubatch, 1);
    s.n_threads = parse_or("EVA_CORE_N_THREADS", s.n_threads);
    s.n_gpu_layers = parse_or("EVA_CORE_N_GPU_LAYERS", s.n_gpu_layers);

    let n_predict = parse_or("EVA_CORE_N_PREDICT", s.max_predict);
    if n_predict >= -1 {
        s.max_predict = n_predict;
    }

    let sampling = &mut s.sampling;
    let temp = parse_or("EVA_CORE_TEMP", sampling.temperature);
    if (0.0..=2.0).contains(&temp) {
        sampling.temperature = temp;
    }
    sampling.top_k = parse_or("EVA_CORE_TOP_K", sampling.top_k);
    let top_p = parse_or("EVA_CORE_TOP_P", sampling.top_p);
    if top_p > 0.0 && top_p <= 1.0 {
        sampling.top_p = top_p;
    }
    let repeat = parse_or("EVA_CORE_REPEAT", sampling.repetition_penalty);
    if repeat.is_finite() && repeat >= 1.0 {
        sampling.repetition_penalty = repeat;
    }
    if let Ok(seed) = std::env::var("EVA_CORE_SEED") {
        if let Ok(seed) = seed.trim().parse::<u32>() {
            sampling.seed = Some(seed);
        }
    }

    if let Ok(path) = std::env::var("EVA_CORE_MMPROJ") {
        if !path.trim().is_empty() {
            s.mmproj_path = Some(PathBuf::from(path.trim()));
        }
    }
    if let Ok(path) = std::env::var("EVA_CORE_LORA") {
        if !path.trim().is_empty() {
            s.lora_path = Some(PathBuf::from(path.trim()));
        }
    }
    if let Ok(format) = std::env::var("EVA_CORE_LOG_FORMAT") {
        if let Some(format) = LogFormat::parse(&format) {
            config.logging.format = format;
        }
    }
}

/// Load a TOML file, then overlay the environment.
pub fn load_file(path: impl AsRef<Path>) -> Result<EvaConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: EvaConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env(&mut config);
    config.validated()
}

/// Load from `EVA_CORE_CONFIG` when set, else defaults, then the environment.
pub fn load() -> Result<EvaConfig, ConfigError> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => load_file(path.trim()),
        _ => {
            let mut config = EvaConfig::default();
            apply_env(&mut config);
            config.validated()
        }
    }
}
