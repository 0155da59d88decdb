use thiserror::Error;

/// A model call that did not produce a usable JSON object.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{provider} API error ({status}): {message}")]
    Upstream {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("response contained no content")]
    Empty,
    #[error("response has unexpected shape: {0}")]
    Shape(String),
    #[error("{0} does not support image generation")]
    Unsupported(&'static str),
}

impl GatewayError {
    /// Shape error for a missing or mistyped response field.
    pub fn missing(field: &str) -> Self {
        Self::Shape(format!("missing or invalid field `{}`", field))
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("story store error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("story store is not configured: {0}")]
    NotConfigured(&'static str),
}

/// Local precondition failures. These never reach the network.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("an API key is required")]
    MissingCredential,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("another request is still running")]
    Busy,
    #[error("`{action}` is not available during {phase}")]
    WrongPhase { action: &'static str, phase: String },
    #[error("choose at least one character")]
    EmptySelection,
    #[error("unknown character: {0}")]
    UnknownCharacter(String),
    #[error("no theme with index {0}")]
    NoSuchTheme(usize),
    #[error("no option with index {0}")]
    NoSuchOption(usize),
    #[error("no saved story with index {0}")]
    NoSuchStory(usize),
    #[error("section {0} does not exist")]
    NoSuchSection(String),
    #[error("language {0} is already active")]
    SameLanguage(String),
    #[error("unsupported language: {0}")]
    UnknownLanguage(String),
    #[error("no language switch is waiting for confirmation")]
    NothingToConfirm,
    #[error("pick a preset change or describe what to change")]
    EmptyModification,
    #[error("prompt template {template} has no value for `{placeholder}`")]
    MissingPromptValue {
        template: String,
        placeholder: String,
    },
}

#[derive(Debug, Error)]
pub enum StoryError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type StoryResult<T> = std::result::Result<T, StoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_is_kept_verbatim() {
        let err = GatewayError::Upstream {
            provider: "OpenAI",
            status: 401,
            message: "Incorrect API key provided: sk-***".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "OpenAI API error (401): Incorrect API key provided: sk-***"
        );
    }

    #[test]
    fn test_story_error_is_transparent() {
        let err: StoryError = ValidationError::EmptySelection.into();
        assert_eq!(err.to_string(), "choose at least one character");
    }
}
