//! Stop-condition detection.
//!
//! Two states: `Scanning` checks output against the antiprompts, and
//! `Suppressed` (inside a reasoning block) passes text through untouched
//! until the close marker. Text that could still grow into an antiprompt or
//! an open marker is held back, so a matched antiprompt never reaches the
//! caller.

use std::collections::HashSet;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use super::config::ThinkMarkers;
use super::error::SessionError;
use super::output::{FinishReason, StreamChunk};
use crate::memory::TokenId;

/// Characters of recent output kept for the template-leak check.
pub const WINDOW_CHARS: usize = 32;

/// Stop conditions for one predict call.
#[derive(Debug, Clone, Default)]
pub struct StopConfig {
    /// Terminal token ids (EOS, EOT, BOS).
    pub eos_ids: HashSet<TokenId>,
    /// Case-insensitive stop substrings.
    pub antiprompts: Vec<String>,
    /// Tokens to sample per predict. -1 = unbounded.
    pub max_predict: i32,
    pub think_markers: Option<ThinkMarkers>,
    pub halt_on_template_leak: bool,
}

impl StopConfig {
    pub fn predict_limit(&self) -> Option<u32> {
        u32::try_from(self.max_predict).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Scanning,
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop(FinishReason),
}

/// Result of feeding one token's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub chunks: Vec<StreamChunk>,
    pub verdict: Verdict,
}

pub struct StopDetector {
    config: StopConfig,
    matcher: Option<AhoCorasick>,
    state: ScanState,
    held: String,
    window: String,
}

impl StopDetector {
    pub fn new(mut config: StopConfig) -> Result<Self, SessionError> {
        config.antiprompts.retain(|w| !w.is_empty());
        let matcher = if config.antiprompts.is_empty() {
            None
        } else {
            let matcher = AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostFirst)
                .build(&config.antiprompts)
                .map_err(|e| SessionError::InvalidConfig(format!("antiprompts: {e}")))?;
            Some(matcher)
        };
        Ok(Self {
            config,
            matcher,
            state: ScanState::Scanning,
            held: String::new(),
            window: String::new(),
        })
    }

    pub fn config(&self) -> &StopConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// End-of-generation token: stop without rendering it.
    pub fn is_terminal(&self, token: TokenId) -> bool {
        self.config.eos_ids.contains(&token)
    }

    /// Feed the text of one sampled token.
    pub fn feed(&mut self, text: &str) -> Scan {
        let mut input = std::mem::take(&mut self.held);
        input.push_str(text);
        let mut chunks = Vec::new();
        let mut rest = input.as_str();

        loop {
            match self.state {
                ScanState::Scanning => {
                    let stop = self
                        .matcher
                        .as_ref()
                        .and_then(|m| m.find(rest))
                        .map(|m| (m.start(), m.pattern().as_usize()));
                    let open = self
                        .config
                        .think_markers
                        .as_ref()
                        .and_then(|mk| rest.find(mk.open.as_str()).map(|at| (at, mk.open.len())));

                    match (stop, open) {
                        (Some((at, index)), o) if o.map_or(true, |(o_at, _)| at <= o_at) => {
                            self.emit_content(&mut chunks, &rest[..at]);
                            return Scan {
                                chunks,
                                verdict: Verdict::Stop(FinishReason::StopWord { index }),
                            };
                        }
                        (_, Some((at, len))) => {
                            self.emit_content(&mut chunks, &rest[..at]);
                            push_chunk(&mut chunks, StreamChunk::reasoning(&rest[at..at + len]));
                            self.state = ScanState::Suppressed;
                            rest = &rest[at + len..];
                        }
                        _ => {
                            let hold = self.scanning_holdback(rest);
                            let (emit, held) = rest.split_at(rest.len() - hold);
                            self.emit_content(&mut chunks, emit);
                            self.held = held.to_owned();
                            let verdict = if self.leaked() {
                                Verdict::Stop(FinishReason::TemplateLeak)
                            } else {
                                Verdict::Continue
                            };
                            return Scan { chunks, verdict };
                        }
                    }
                }
                ScanState::Suppressed => {
                    let Some(close) = self.config.think_markers.as_ref().map(|m| m.close.as_str())
                    else {
                        self.state = ScanState::Scanning;
                        continue;
                    };
                    match rest.find(close) {
                        Some(at) => {
                            let end = at + close.len();
                            push_chunk(&mut chunks, StreamChunk::reasoning(&rest[..end]));
                            self.state = ScanState::Scanning;
                            rest = &rest[end..];
                        }
                        None => {
                            let hold = holdback(rest, std::iter::once(close));
                            let (emit, held) = rest.split_at(rest.len() - hold);
                            push_chunk(&mut chunks, StreamChunk::reasoning(emit));
                            self.held = held.to_owned();
                            return Scan {
                                chunks,
                                verdict: Verdict::Continue,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Release held-back text at stream end.
    pub fn flush(&mut self) -> Option<StreamChunk> {
        if self.held.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.held);
        Some(match self.state {
            ScanState::Scanning => StreamChunk::content(text),
            ScanState::Suppressed => StreamChunk::reasoning(text),
        })
    }

    /// Lowercased tail of recent output.
    pub fn window(&self) -> &str {
        &self.window
    }

    fn emit_content(&mut self, chunks: &mut Vec<StreamChunk>, text: &str) {
        if text.is_empty() {
            return;
        }
        self.window.push_str(&text.to_ascii_lowercase());
        let excess = self.window.chars().count().saturating_sub(WINDOW_CHARS);
        if excess > 0 {
            let cut = self
                .window
                .char_indices()
                .nth(excess)
                .map_or(self.window.len(), |(i, _)| i);
            self.window.drain(..cut);
        }
        push_chunk(chunks, StreamChunk::content(text));
    }

    fn scanning_holdback(&self, text: &str) -> usize {
        let open = self.config.think_markers.as_ref().map(|m| m.open.as_str());
        holdback(
            text,
            self.config
                .antiprompts
                .iter()
                .map(String::as_str)
                .chain(open),
        )
    }

    fn leaked(&self) -> bool {
        self.config.halt_on_template_leak
            && self.window.contains("<|")
            && self.window.contains("|>")
    }
}

fn push_chunk(chunks: &mut Vec<StreamChunk>, chunk: StreamChunk) {
    if !chunk.text.is_empty() {
        chunks.push(chunk);
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of one of
/// `patterns` (ASCII case-insensitive).
fn holdback<'a>(text: &str, patterns: impl Iterator<Item = &'a str>) -> usize {
    let bytes = text.as_bytes();
    let mut best = 0;
    for pattern in patterns {
        let max = pattern.len().saturating_sub(1).min(text.len());
        for k in (best + 1..=max).rev() {
            let start = text.len() - k;
            if !text.is_char_boundary(start) || !pattern.is_char_boundary(k) {
                continue;
            }
            if bytes[start..].eq_ignore_ascii_case(&pattern.as_bytes()[..k]) {
                best = k;
                break;
            }
        }
    }
    best
}
