//! Chat template fragments.
//!
//! A session wraps each input turn in text fragments taken from the model's
//! chat template. Hosts either pass fragments explicitly or let the session
//! derive them by rendering a marker conversation through the model's
//! built-in template and cutting it apart at the markers.

use serde::{Deserialize, Serialize};

/// Stop word that ends a turn where a tool result is expected.
pub const OBSERVATION_STOPWORD: &str = "<|observation|>";

/// Role name used for tool/observation turns.
pub const TOOL_ROLE: &str = "tool";

/// System prompt used when the configured one does not fit.
pub const FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const SYSTEM_MARK: &str = "eva_prompt_mark";
const USER_MSG1: &str = "eva_use_msg1";
const MODEL_MSG1: &str = "eva_model_msg1";
const USER_MSG2: &str = "eva_use_msg2";
const MODEL_MSG2: &str = "eva_model_msg2";
const TEMPLATE_USER: &str = "user";
const TEMPLATE_MODEL: &str = "assistant";

/// One message handed to a chat template renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Text wrapped around the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFragments {
    pub system_prompt: String,
    pub input_prefix: String,
    pub input_suffix: String,
    pub tool_prefix: String,
}

/// Names and instruction woven into derived fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    pub instruction: String,
    pub user_name: String,
    pub model_name: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            instruction: FALLBACK_SYSTEM_PROMPT.into(),
            user_name: TEMPLATE_USER.into(),
            model_name: TEMPLATE_MODEL.into(),
        }
    }
}

/// Everything `reset` needs to know about the conversation frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatTemplateState {
    /// Explicit fragments. None = derive from the model's template.
    pub fragments: Option<TemplateFragments>,
    pub persona: Persona,
    pub extra_stop_words: Vec<String>,
    /// Raw continuation: no system prompt, no wrapping, no antiprompts.
    pub completion_mode: bool,
}

impl ChatTemplateState {
    pub fn with_fragments(fragments: TemplateFragments) -> Self {
        Self {
            fragments: Some(fragments),
            ..Self::default()
        }
    }

    pub fn completion() -> Self {
        Self {
            completion_mode: true,
            ..Self::default()
        }
    }

    /// Stop generation where the model hands control to a tool.
    pub fn with_tools(mut self) -> Self {
        if !self.extra_stop_words.iter().any(|w| w == OBSERVATION_STOPWORD) {
            self.extra_stop_words.push(OBSERVATION_STOPWORD.into());
        }
        self
    }

    /// Resolve fragments, rendering the marker conversation if needed.
    pub fn resolve<F>(&self, render: F) -> TemplateFragments
    where
        F: FnOnce(&[ChatTurn]) -> Option<String>,
    {
        if let Some(fragments) = &self.fragments {
            return fragments.clone();
        }
        render(&marker_conversation())
            .and_then(|rendered| split_rendered(&rendered, &self.persona))
            .unwrap_or_else(|| plain_fragments(&self.persona))
    }

    /// Antiprompts for a reset: the lowercased input prefix first (when it
    /// is not blank), then the extra stop words.
    pub fn antiprompts(&self, fragments: &TemplateFragments) -> Vec<String> {
        if self.completion_mode {
            return Vec::new();
        }
        let mut words = Vec::with_capacity(1 + self.extra_stop_words.len());
        if let Some(prefix) = prefix_antiprompt(fragments) {
            words.push(prefix);
        }
        words.extend(
            self.extra_stop_words
                .iter()
                .filter(|w| !w.trim().is_empty())
                .cloned(),
        );
        words
    }
}

/// The stop word derived from the input prefix, if any.
pub fn prefix_antiprompt(fragments: &TemplateFragments) -> Option<String> {
    if fragments.input_prefix.trim().is_empty() {
        None
    } else {
        Some(fragments.input_prefix.to_ascii_lowercase())
    }
}

fn marker_conversation() -> Vec<ChatTurn> {
    vec![
        ChatTurn::new("system", SYSTEM_MARK),
        ChatTurn::new(TEMPLATE_USER, USER_MSG1),
        ChatTurn::new(TEMPLATE_MODEL, MODEL_MSG1),
        ChatTurn::new(TEMPLATE_USER, USER_MSG2),
        ChatTurn::new(TEMPLATE_MODEL, MODEL_MSG2),
    ]
}

fn split_rendered(rendered: &str, persona: &Persona) -> Option<TemplateFragments> {
    let (head, after_system) = rendered.split_once(SYSTEM_MARK)?;
    let (_, after_model1) = after_system.split_once(MODEL_MSG1)?;
    let (prefix, after_user2) = after_model1.split_once(USER_MSG2)?;
    let (suffix, _) = after_user2.split_once(MODEL_MSG2)?;

    Some(TemplateFragments {
        system_prompt: format!(
            "{}{}",
            head.replace(TEMPLATE_USER, &persona.user_name),
            persona.instruction
        ),
        input_prefix: prefix.replace(TEMPLATE_USER, &persona.user_name),
        input_suffix: suffix.replace(TEMPLATE_MODEL, &persona.model_name),
        tool_prefix: prefix.replace(TEMPLATE_USER, TOOL_ROLE),
    })
}

fn plain_fragments(persona: &Persona) -> TemplateFragments {
    TemplateFragments {
        system_prompt: format!("{}\n", persona.instruction),
        input_prefix: format!("\n{}: ", persona.user_name),
        input_suffix: format!("\n{}: ", persona.model_name),
        tool_prefix: format!("\n{TOOL_ROLE}: "),
    }
}
