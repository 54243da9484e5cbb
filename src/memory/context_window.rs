//! Context Window Manager.
//!
//! Keeps `n_past + pending` below the context size by discarding the older
//! half of the non-protected region. The protected prefix (the system prompt)
//! is never partially evicted; only a full reset removes it.

use thiserror::Error;

use super::token_cache::{TokenCache, TokenId};

/// Slack kept free between the end of a pending batch and `n_ctx`.
pub const BATCH_HEADROOM: usize = 4;

/// A KV cache edit the engine refused.
#[derive(Debug, Error)]
#[error("kv cache {op} over [{from}, {to:?}) failed: {reason}")]
pub struct CacheEditError {
    pub op: &'static str,
    pub from: usize,
    pub to: Option<usize>,
    pub reason: String,
}

/// Sequence-level edits on the engine's KV cache (sequence 0).
///
/// Positions are 0-based. `to = None` means "to the end of the sequence".
pub trait KvSequence {
    /// Drop cells in `[from, to)`.
    fn seq_remove(&mut self, from: usize, to: Option<usize>) -> Result<(), CacheEditError>;

    /// Add `delta` to the position of every cell in `[from, to)`.
    fn seq_shift(&mut self, from: usize, to: usize, delta: isize) -> Result<(), CacheEditError>;

    /// Drop every cell of every sequence.
    fn seq_clear(&mut self);
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Edit(#[from] CacheEditError),

    #[error("context exhausted: n_past {n_past}, protected {protected}, pending {pending}, n_ctx {n_ctx}")]
    Exhausted {
        n_past: usize,
        protected: usize,
        pending: usize,
        n_ctx: usize,
    },
}

/// One discard round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub discarded: usize,
    pub n_past_before: usize,
    pub n_past_after: usize,
}

/// Overflow policy for a fixed context size.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    n_ctx: usize,
}

impl ContextWindow {
    pub fn new(n_ctx: usize) -> Self {
        Self { n_ctx }
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    /// Largest batch that fits after the protected prefix.
    pub fn max_batch(&self, protected: usize) -> usize {
        self.n_ctx.saturating_sub(BATCH_HEADROOM + protected)
    }

    /// True when pushing `pending` tokens would overrun the window.
    pub fn needs_room(&self, n_past: usize, pending: usize) -> bool {
        n_past + pending >= self.n_ctx.saturating_sub(1)
    }

    /// Drop the tail of an oversized pending batch. Returns the skipped count.
    pub fn clamp_pending(&self, pending: &mut Vec<TokenId>, protected: usize) -> usize {
        let max = self.max_batch(protected);
        if pending.len() <= max {
            return 0;
        }
        let skipped = pending.len() - max;
        pending.truncate(max);
        skipped
    }

    /// Evict until `pending` more tokens fit.
    ///
    /// Each round removes `(n_past - protected) / 2` cells right after the
    /// protected prefix, shifts the remainder back and mirrors the edit in
    /// the ledger.
    pub fn make_room<K: KvSequence + ?Sized>(
        &self,
        kv: &mut K,
        cache: &mut TokenCache,
        n_past: &mut usize,
        protected: usize,
        pending: usize,
    ) -> Result<Vec<Eviction>, ContextError> {
        let mut rounds = Vec::new();
        while self.needs_room(*n_past, pending) {
            let discard = n_past.saturating_sub(protected) / 2;
            if discard == 0 {
                return Err(ContextError::Exhausted {
                    n_past: *n_past,
                    protected,
                    pending,
                    n_ctx: self.n_ctx,
                });
            }

            let before = *n_past;
            kv.seq_remove(protected, Some(protected + discard))?;
            kv.seq_shift(protected + discard, before, -(discard as isize))?;
            cache.evict(protected, discard);
            *n_past -= discard;

            rounds.push(Eviction {
                discarded: discard,
                n_past_before: before,
                n_past_after: *n_past,
            });
        }
        Ok(rounds)
    }
}
