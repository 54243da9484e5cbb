//! Predict input types and validation for EVA-CORE.
//!
//! Inputs are validated before any token reaches the decode engine.

use std::path::PathBuf;

use super::error::SessionError;

/// Maximum text input size in bytes (256KB).
pub const MAX_TEXT_BYTES: usize = 262_144;

/// Maximum media attachments per predict.
pub const MAX_MEDIA_PER_INPUT: usize = 8;

/// Who produced the input turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Wrapped in the user prefix and suffix.
    User,
    /// Tool/observation output, wrapped in the tool prefix and suffix.
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Tool => "tool",
        }
    }
}

/// One predict request.
#[derive(Debug, Clone)]
pub struct PredictInput {
    pub role: Role,
    pub text: String,
    pub media_paths: Vec<PathBuf>,
}

impl PredictInput {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            media_paths: Vec::new(),
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            text: text.into(),
            media_paths: Vec::new(),
        }
    }

    pub fn with_media(mut self, path: impl Into<PathBuf>) -> Self {
        self.media_paths.push(path.into());
        self
    }

    /// Validate size limits. Empty text is allowed when media is attached.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.text.is_empty() && self.media_paths.is_empty() {
            return Err(SessionError::InvalidInput(
                "text cannot be empty without media".into(),
            ));
        }
        if self.text.len() > MAX_TEXT_BYTES {
            return Err(SessionError::InvalidInput(format!(
                "text exceeds maximum size: {} > {} bytes",
                self.text.len(),
                MAX_TEXT_BYTES
            )));
        }
        if self.media_paths.len() > MAX_MEDIA_PER_INPUT {
            return Err(SessionError::InvalidInput(format!(
                "too many media attachments: {} > {}",
                self.media_paths.len(),
                MAX_MEDIA_PER_INPUT
            )));
        }
        Ok(())
    }
}
