//! UTF-8 reassembly for streamed tokens.
//!
//! Byte-level tokenizers split multi-byte characters across tokens. The
//! reassembler holds such tokens back until the joined bytes form complete
//! UTF-8, so callers only ever see whole characters.

use crate::memory::TokenId;

/// Tokens held before giving up on a sequence and flushing it lossily.
const MAX_PENDING_TOKENS: usize = 4;

/// True if `bytes` ends in the middle of a multi-byte sequence.
///
/// Only the trailing 1–4 bytes are inspected: a lead byte whose sequence
/// needs more bytes than follow it marks the buffer incomplete.
pub fn is_incomplete_utf8(bytes: &[u8]) -> bool {
    for i in 1..=bytes.len().min(4) {
        let c = bytes[bytes.len() - i];
        if c & 0xC0 == 0x80 {
            continue;
        }
        if c & 0xE0 == 0xC0 {
            return i < 2;
        }
        if c & 0xF0 == 0xE0 {
            return i < 3;
        }
        if c & 0xF8 == 0xF0 {
            return i < 4;
        }
        return false;
    }
    false
}

/// Buffers tokens whose bytes end in a partial character.
#[derive(Debug, Default)]
pub struct Utf8Reassembler {
    tokens: Vec<TokenId>,
    bytes: Vec<u8>,
}

impl Utf8Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token's bytes. Returns the text ready to emit, which is
    /// empty while a partial character is buffered.
    pub fn push(&mut self, token: TokenId, bytes: &[u8]) -> String {
        if self.tokens.is_empty() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                return text.to_owned();
            }
            if !is_incomplete_utf8(bytes) {
                return String::from_utf8_lossy(bytes).into_owned();
            }
        }

        self.tokens.push(token);
        self.bytes.extend_from_slice(bytes);

        if std::str::from_utf8(&self.bytes).is_ok() {
            return self.take_lossy();
        }
        if is_incomplete_utf8(&self.bytes) && self.tokens.len() < MAX_PENDING_TOKENS {
            return String::new();
        }
        tracing::debug!(
            tokens = ?self.tokens,
            "token bytes never formed valid utf-8, flushing lossily"
        );
        self.take_lossy()
    }

    /// Token ids currently held back.
    pub fn pending(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Drop any unresolved bytes. Returns how many bytes were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.bytes.len();
        self.tokens.clear();
        self.bytes.clear();
        dropped
    }

    fn take_lossy(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        self.tokens.clear();
        self.bytes.clear();
        text
    }
}
