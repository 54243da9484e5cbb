//! Session events for hosts.
//!
//! Everything sent here is an owned copy; the session keeps no references
//! into what a subscriber holds.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::engine::FinishReason;
use crate::memory::CacheEntry;

/// Which path a reset took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResetPath {
    /// Engine cache wiped and the system prefix decoded again.
    Full,
    /// Everything after the system prefix removed.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    CacheSnapshot(Vec<CacheEntry>),
    CacheFill {
        percent: f32,
        n_past: usize,
        n_ctx: usize,
    },
    Truncated {
        discarded: usize,
    },
    InputTrimmed {
        skipped: usize,
    },
    FillerInserted {
        n_past: usize,
    },
    MediaDecodeFailed {
        reason: String,
    },
    ResetCompleted {
        path: ResetPath,
        system_prefix_len: usize,
        system_prompt_truncated: bool,
    },
    GenerationFinished {
        tokens_per_sec_single: f64,
        tokens_per_sec_batched: f64,
        tokens_generated: u32,
        reason: FinishReason,
    },
}

/// Non-blocking event fan-out to at most one subscriber.
#[derive(Debug, Default)]
pub struct EventEmitter {
    sender: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the subscriber. The previous receiver sees its stream end.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sender = Some(tx);
        rx
    }

    pub fn is_subscribed(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Send if someone listens. Snapshots are only built on demand.
    pub fn emit_with(&mut self, event: impl FnOnce() -> SessionEvent) {
        let Some(sender) = &self.sender else { return };
        if sender.send(event()).is_err() {
            tracing::debug!("event subscriber dropped");
            self.sender = None;
        }
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.emit_with(|| event);
    }
}
