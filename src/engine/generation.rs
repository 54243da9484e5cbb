//! The decode loop of one predict call.
//!
//! Each `next()` runs at most one loop iteration: stop checks, a decode of
//! whatever is pending, one sample, detokenize, stop scan. Text comes out
//! as it is produced; nothing is buffered beyond what the stop detector
//! holds back.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::Span;

use super::backend::{DecodeEngine, EngineLoader};
use super::cancel::GenerationGuard;
use super::error::SessionError;
use super::output::{FinishReason, GenerationSummary, StreamChunk};
use super::session::{Flow, Session};
use super::stop::{ScanState, StopDetector, Verdict};
use crate::telemetry::{metrics, SessionEvent};

/// Decode throughput, split between prompt-side batches and single-token
/// steps.
#[derive(Debug, Clone, Default)]
pub struct DecodeTimer {
    single_tokens: u64,
    single_time: Duration,
    batch_tokens: u64,
    batch_time: Duration,
}

impl DecodeTimer {
    /// Record one successful decode of `tokens` tokens.
    pub fn record(&mut self, tokens: usize, elapsed: Duration) {
        if tokens > 1 {
            self.batch_tokens += tokens as u64;
            self.batch_time += elapsed;
        } else {
            self.single_tokens += tokens as u64;
            self.single_time += elapsed;
        }
    }

    /// `(single, batched)` tokens per second. Zero when nothing was timed.
    pub fn rates(&self) -> (f64, f64) {
        (
            rate(self.single_tokens, self.single_time),
            rate(self.batch_tokens, self.batch_time),
        )
    }
}

fn rate(tokens: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if tokens == 0 || secs <= 0.0 {
        0.0
    } else {
        tokens as f64 / secs
    }
}

/// Everything a generation produced, for callers that do not stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub reasoning: String,
    pub summary: GenerationSummary,
}

/// A running generation. Yields chunks until a stop condition fires.
///
/// Dropping it early finishes the generation as [`FinishReason::Cancelled`].
pub struct Generation<'s, L: EngineLoader> {
    session: &'s mut Session<L>,
    detector: StopDetector,
    outbox: VecDeque<StreamChunk>,
    remaining: Option<u32>,
    tokens_generated: u32,
    timer: DecodeTimer,
    summary: Option<GenerationSummary>,
    span: Span,
    _guard: GenerationGuard,
}

impl<'s, L: EngineLoader> Generation<'s, L> {
    pub(crate) fn new(
        session: &'s mut Session<L>,
        detector: StopDetector,
        guard: GenerationGuard,
        span: Span,
        timer: DecodeTimer,
    ) -> Self {
        let remaining = detector.config().predict_limit();
        Self {
            session,
            detector,
            outbox: VecDeque::new(),
            remaining,
            tokens_generated: 0,
            timer,
            summary: None,
            span,
            _guard: guard,
        }
    }

    /// Set once the generation has finished.
    pub fn summary(&self) -> Option<&GenerationSummary> {
        self.summary.as_ref()
    }

    pub fn tokens_generated(&self) -> u32 {
        self.tokens_generated
    }

    /// Drive the generation to the end and gather its text.
    pub fn complete(mut self) -> Result<Completion, SessionError> {
        let mut content = String::new();
        let mut reasoning = String::new();
        for item in self.by_ref() {
            let chunk = item?;
            if chunk.is_reasoning {
                reasoning.push_str(&chunk.text);
            } else {
                content.push_str(&chunk.text);
            }
        }
        let summary = self.summary.clone().unwrap_or_else(|| GenerationSummary {
            finish_reason: FinishReason::Cancelled,
            tokens_generated: self.tokens_generated,
            tokens_per_sec_single: 0.0,
            tokens_per_sec_batched: 0.0,
        });
        Ok(Completion {
            content,
            reasoning,
            summary,
        })
    }

    /// One loop iteration. `Some(reason)` ends the generation.
    fn step(&mut self) -> Result<Option<FinishReason>, SessionError> {
        let session = &mut *self.session;
        if session.stop.is_requested() {
            return Ok(Some(FinishReason::Cancelled));
        }
        if self.remaining == Some(0) {
            return Ok(Some(FinishReason::MaxTokens));
        }

        let engine = session.engine.as_mut().ok_or(SessionError::NotLoaded)?;
        let core = &mut session.core;
        if !core.state.pending_input_tokens.is_empty() {
            let flow = core.decode_pending(engine, &mut self.timer, Some(&session.stop))?;
            if flow == Flow::Interrupted {
                return Ok(Some(FinishReason::Cancelled));
            }
        }

        let token = engine.sample();
        engine.accept(token);
        self.tokens_generated += 1;
        metrics::record_token_generated();
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        if self.detector.is_terminal(token) {
            return Ok(Some(FinishReason::Stop));
        }
        core.state.pending_input_tokens.push(token);

        let bytes = engine.detokenize(token)?;
        let text = core.utf8.push(token, &bytes);
        if text.is_empty() {
            return Ok(None);
        }

        let scan = self.detector.feed(&text);
        core.state.think_mode = self.detector.state() == ScanState::Suppressed;
        self.outbox.extend(scan.chunks);
        match scan.verdict {
            Verdict::Continue => Ok(None),
            Verdict::Stop(reason) => Ok(Some(reason)),
        }
    }

    fn finish(&mut self, reason: FinishReason) {
        if self.summary.is_some() {
            return;
        }
        if !matches!(reason, FinishReason::StopWord { .. } | FinishReason::Failed) {
            if let Some(chunk) = self.detector.flush() {
                self.outbox.push_back(chunk);
            }
        }

        let span = self.span.clone();
        let tokens_generated = self.tokens_generated;
        let session = &mut *self.session;
        let core = &mut session.core;
        if reason.discards_last_token() {
            core.state.pending_input_tokens.clear();
        }
        let dropped = core.utf8.discard();
        if dropped > 0 {
            tracing::debug!(parent: &span, tokens = dropped, "dropped incomplete utf-8 tail");
        }
        core.state.think_mode = false;
        if let FinishReason::StopWord { index: 0 } = reason {
            session.skip_next_prefix = session.prefix_stop;
        }

        let (single, batched) = self.timer.rates();
        span.record("finish_reason", reason.as_str());
        span.record("tokens_generated", tokens_generated);
        if reason == FinishReason::Failed {
            span.record("status", "error");
        } else {
            span.record("status", "ok");
        }
        tracing::info!(
            parent: &span,
            reason = reason.as_str(),
            tokens_generated,
            tokens_per_sec_single = single,
            tokens_per_sec_batched = batched,
            n_past = core.state.n_past,
            "generation finished"
        );
        metrics::record_generation(reason.as_str(), single, batched);
        core.events.emit(SessionEvent::GenerationFinished {
            tokens_per_sec_single: single,
            tokens_per_sec_batched: batched,
            tokens_generated,
            reason: reason.clone(),
        });
        core.publish_cache();

        self.summary = Some(GenerationSummary {
            finish_reason: reason,
            tokens_generated,
            tokens_per_sec_single: single,
            tokens_per_sec_batched: batched,
        });
    }
}

impl<L: EngineLoader> Iterator for Generation<'_, L> {
    type Item = Result<StreamChunk, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.outbox.pop_front() {
                return Some(Ok(chunk));
            }
            if self.summary.is_some() {
                return None;
            }
            match self.step() {
                Ok(None) => {}
                Ok(Some(reason)) => self.finish(reason),
                Err(e) => {
                    tracing::error!(parent: &self.span, error = %e, "generation failed");
                    self.span.record("error.message", e.to_string().as_str());
                    self.finish(FinishReason::Failed);
                    self.outbox.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<L: EngineLoader> Drop for Generation<'_, L> {
    fn drop(&mut self) {
        if self.summary.is_none() {
            self.finish(FinishReason::Cancelled);
        }
    }
}
