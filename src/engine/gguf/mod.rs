//! GGUF decode engine (llama-cpp-2).
//!
//! Media input additionally needs the `multimodal` feature and an mmproj
//! file in the session config.

mod backend;

pub use backend::{LlamaEngine, LlamaLoader, LlamaMedia};
