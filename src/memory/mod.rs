//! Token cache bookkeeping for the session engine.
//!
//! The ledger mirrors the decode engine's KV cache; the context window
//! decides when and how much of it to discard.

mod context_window;
mod token_cache;

pub use context_window::{
    CacheEditError, ContextError, ContextWindow, Eviction, KvSequence, BATCH_HEADROOM,
};
pub use token_cache::{CacheEntry, TokenCache, TokenId, FILLER_TOKEN, MEDIA_TOKEN};
