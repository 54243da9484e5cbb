//! Token Cache Model ("brain").
//!
//! An ordered ledger that mirrors the decode engine's KV cache, one row per
//! occupied position. The ledger is what hosts render for introspection; it
//! is never handed out by reference, only as owned snapshots.
//!
//! # Invariants
//! - `entries[i].position == i + 1` after every mutation.
//! - `len()` equals the session's `n_past` once a mutation completes.

use serde::{Deserialize, Serialize};

/// Token identifier as understood by the decode engine.
pub type TokenId = i32;

/// Sentinel token id for a filler row inserted after a slot failure.
pub const FILLER_TOKEN: TokenId = -1;

/// Sentinel token id for a row occupied by an injected media chunk.
pub const MEDIA_TOKEN: TokenId = -2;

/// One occupied KV position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// 1-based position in the cache.
    pub position: usize,
    /// Decoded token, or one of [`FILLER_TOKEN`] / [`MEDIA_TOKEN`].
    pub token_id: TokenId,
    /// Lossy text of the token, empty for fillers.
    pub text: String,
}

impl CacheEntry {
    pub fn is_filler(&self) -> bool {
        self.token_id == FILLER_TOKEN
    }

    pub fn is_media(&self) -> bool {
        self.token_id == MEDIA_TOKEN
    }
}

/// Ledger of occupied KV positions.
#[derive(Debug, Default, Clone)]
pub struct TokenCache {
    entries: Vec<CacheEntry>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n_ctx: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n_ctx),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// Owned copy of the ledger for hosts.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.clone()
    }

    /// Token ids in position order (fillers and media included).
    pub fn token_ids(&self) -> Vec<TokenId> {
        self.entries.iter().map(|e| e.token_id).collect()
    }

    /// Append a decoded token.
    pub fn push(&mut self, token_id: TokenId, text: impl Into<String>) {
        let position = self.entries.len() + 1;
        self.entries.push(CacheEntry {
            position,
            token_id,
            text: text.into(),
        });
    }

    /// Append a filler row standing in for a position skipped by a retry.
    pub fn push_filler(&mut self) {
        self.push(FILLER_TOKEN, String::new());
    }

    /// Append `count` media placeholder rows.
    pub fn push_media(&mut self, count: usize, label: &str) {
        self.entries.reserve(count);
        for _ in 0..count {
            self.push(MEDIA_TOKEN, label);
        }
    }

    /// Keep the first `len` rows (partial clear).
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove `discard` rows starting at `keep` and renumber the remainder.
    ///
    /// Rows before `keep` are untouched. Returns the number of rows actually
    /// removed, which is smaller than `discard` only if the ledger is shorter.
    pub fn evict(&mut self, keep: usize, discard: usize) -> usize {
        if keep >= self.entries.len() || discard == 0 {
            return 0;
        }
        let end = (keep + discard).min(self.entries.len());
        self.entries.drain(keep..end);
        for (i, entry) in self.entries.iter_mut().enumerate().skip(keep) {
            entry.position = i + 1;
        }
        end - keep
    }

    /// Fill level relative to the context size, in percent.
    pub fn fill_percent(&self, n_ctx: usize) -> f32 {
        if n_ctx == 0 {
            return 0.0;
        }
        (self.entries.len() as f32 / n_ctx as f32 * 100.0).min(100.0)
    }

    /// True when every row sits at `index + 1`.
    pub fn is_contiguous(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.position == i + 1)
    }

    /// Serialize the ledger as JSON for external inspection.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> TokenCache {
        let mut cache = TokenCache::new();
        for i in 0..n {
            cache.push(100 + i as TokenId, format!("t{i}"));
        }
        cache
    }

    #[test]
    fn test_push_assigns_one_based_positions() {
        let cache = filled(3);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.entries()[0].position, 1);
        assert_eq!(cache.entries()[2].position, 3);
        assert!(cache.is_contiguous());
    }

    #[test]
    fn test_filler_and_media_rows() {
        let mut cache = filled(1);
        cache.push_filler();
        cache.push_media(2, "<|image|>");

        let rows = cache.entries();
        assert!(rows[1].is_filler());
        assert!(rows[1].text.is_empty());
        assert!(rows[2].is_media());
        assert_eq!(rows[3].text, "<|image|>");
        assert_eq!(rows[3].position, 4);
    }

    #[test]
    fn test_evict_keeps_prefix_and_renumbers() {
        let mut cache = filled(10);
        let prefix: Vec<_> = cache.entries()[..2].to_vec();

        let removed = cache.evict(2, 4);

        assert_eq!(removed, 4);
        assert_eq!(cache.len(), 6);
        assert_eq!(&cache.entries()[..2], prefix.as_slice());
        assert_eq!(cache.entries()[2].token_id, 106);
        assert!(cache.is_contiguous());
    }

    #[test]
    fn test_evict_past_end_is_clamped() {
        let mut cache = filled(4);
        assert_eq!(cache.evict(3, 10), 1);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evict(5, 1), 0);
    }

    #[test]
    fn test_truncate_and_fill_percent() {
        let mut cache = filled(8);
        assert!((cache.fill_percent(16) - 50.0).abs() < f32::EPSILON);
        cache.truncate(4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.fill_percent(0), 0.0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut cache = filled(2);
        let snap = cache.snapshot();
        cache.clear();
        assert_eq!(snap.len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_to_json() {
        let cache = filled(1);
        let json = cache.to_json().unwrap();
        assert!(json.contains("\"position\":1"));
        assert!(json.contains("\"token_id\":100"));
    }
}
