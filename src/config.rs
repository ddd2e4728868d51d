use crate::compiler::DEFAULT_MAX_DOCUMENT_CHARS;
use crate::error::{AnalysisError, Result};
use crate::invoker::DEFAULT_MODEL_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_MAX_DOCUMENT_CHARS: &str = "ANALYZER_MAX_DOCUMENT_CHARS";
pub const ENV_MODEL_TIMEOUT_SECS: &str = "ANALYZER_MODEL_TIMEOUT_SECS";
pub const ENV_SESSION_TTL_SECS: &str = "ANALYZER_SESSION_TTL_SECS";
pub const ENV_QA_HISTORY: &str = "ANALYZER_QA_HISTORY";

pub const DEFAULT_QA_HISTORY_WINDOW: usize = 5;

/// Runtime limits for an [`AnalysisPipeline`](crate::AnalysisPipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Longest document text accepted, in characters.
    pub max_document_chars: usize,
    pub model_timeout: Duration,
    /// Idle time after which a session is dropped. `None` keeps sessions
    /// until they are cleared or the store is torn down.
    pub session_ttl: Option<Duration>,
    /// How many earlier exchanges are replayed into a question prompt.
    pub qa_history_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            session_ttl: None,
            qa_history_window: DEFAULT_QA_HISTORY_WINDOW,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_document_chars(mut self, chars: usize) -> Self {
        self.max_document_chars = chars;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn with_qa_history_window(mut self, exchanges: usize) -> Self {
        self.qa_history_window = exchanges;
        self
    }

    /// Defaults overridden by any `ANALYZER_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(chars) = parse_var(&lookup, ENV_MAX_DOCUMENT_CHARS)? {
            config.max_document_chars = chars;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_MODEL_TIMEOUT_SECS)? {
            config.model_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SESSION_TTL_SECS)? {
            config.session_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(window) = parse_var(&lookup, ENV_QA_HISTORY)? {
            config.qa_history_window = window;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_document_chars == 0 {
            return Err(AnalysisError::InvalidRequest(
                "max_document_chars must be greater than zero".to_string(),
            ));
        }
        if self.model_timeout.is_zero() {
            return Err(AnalysisError::InvalidRequest(
                "model_timeout must be greater than zero".to_string(),
            ));
        }
        if self.session_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(AnalysisError::InvalidRequest(
                "session_ttl must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| AnalysisError::InvalidRequest(format!("{}='{}': {}", name, raw, e)))
}
