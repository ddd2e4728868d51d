use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template '{template}' is malformed: {details}")]
    TemplateMalformed { template: String, details: String },

    #[error("Document is too large: {length} characters exceeds the limit of {limit}")]
    DocumentTooLarge { length: usize, limit: usize },

    #[error("Document text is empty")]
    EmptyDocument,

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("No JSON object found in model output")]
    NoJsonFound,

    #[error("Model output is not valid JSON: {0}")]
    JsonParseError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session store error: {0}")]
    SessionStore(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Broad failure classes. Callers pick a recovery strategy per class:
/// transport failures may be retried as-is, content failures need a fresh
/// generation, configuration failures need a fixed template or input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Content,
    Session,
    Request,
    Internal,
}

impl AnalysisError {
    pub fn malformed(template: impl Into<String>, details: impl Into<String>) -> Self {
        Self::TemplateMalformed {
            template: template.into(),
            details: details.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TemplateNotFound(_)
            | Self::TemplateMalformed { .. }
            | Self::DocumentTooLarge { .. }
            | Self::EmptyDocument => ErrorKind::Configuration,
            Self::ModelUnavailable(_) | Self::ModelTimeout(_) => ErrorKind::Transport,
            Self::NoJsonFound | Self::JsonParseError(_) => ErrorKind::Content,
            Self::SessionNotFound(_) | Self::SessionStore(_) => ErrorKind::Session,
            Self::InvalidRequest(_) => ErrorKind::Request,
            Self::SerializationError(_) | Self::IoError(_) => ErrorKind::Internal,
        }
    }

    /// True when repeating the exact same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
