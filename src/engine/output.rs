//! Generation output types for EVA-CORE.

use serde::Serialize;

/// One piece of streamed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    pub text: String,
    /// Inside a reasoning block; hosts render it apart from the answer.
    pub is_reasoning: bool,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_reasoning: false,
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_reasoning: true,
        }
    }
}

/// Reason why a generation finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    /// Model emitted an end-of-sequence / end-of-turn token.
    Stop,
    /// An antiprompt matched; `index` points into the active antiprompt list.
    StopWord { index: usize },
    /// Recent output contained chat-template markup.
    TemplateLeak,
    /// Hit the max_predict limit.
    MaxTokens,
    /// `stop()` was requested or the consumer went away.
    Cancelled,
    /// The decode engine failed.
    Failed,
}

impl FinishReason {
    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::StopWord { .. } => "stop_word",
            Self::TemplateLeak => "template_leak",
            Self::MaxTokens => "max_tokens",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// The last sampled token is dropped rather than kept for the next turn.
    pub fn discards_last_token(&self) -> bool {
        matches!(self, Self::Stop | Self::Failed)
    }
}

/// Totals reported when a generation ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub finish_reason: FinishReason,
    /// Tokens sampled, terminal token included.
    pub tokens_generated: u32,
    pub tokens_per_sec_single: f64,
    pub tokens_per_sec_batched: f64,
}
