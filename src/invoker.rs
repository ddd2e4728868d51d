use crate::compiler::Prompt;
use crate::error::{AnalysisError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Failures an adapter reports for a single call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Network, authentication, rate limiting or an unusable response.
    #[error("{0}")]
    Unavailable(String),

    /// The adapter's own transport gave up waiting.
    #[error("model did not respond within {0:?}")]
    Timeout(Duration),
}

impl From<ModelError> for AnalysisError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Unavailable(reason) => AnalysisError::ModelUnavailable(reason),
            ModelError::Timeout(after) => AnalysisError::ModelTimeout(after),
        }
    }
}

/// A language model that turns a prompt into free-form text.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn invoke(&self, prompt: &Prompt) -> std::result::Result<String, ModelError>;

    /// Name used in log lines.
    fn name(&self) -> &str {
        "model"
    }
}

/// Sends compiled prompts to the configured model under a deadline.
///
/// There are no retries. A call that outlives the deadline is dropped and any
/// partial output is discarded.
#[derive(Clone)]
pub struct AnalysisInvoker {
    adapter: Arc<dyn ModelAdapter>,
    timeout: Duration,
}

impl AnalysisInvoker {
    pub fn new(adapter: Arc<dyn ModelAdapter>, timeout: Duration) -> Self {
        Self { adapter, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn invoke(&self, prompt: &Prompt) -> Result<String> {
        debug!(
            "Invoking {} ({} system chars, {} user chars, timeout {:?})",
            self.adapter.name(),
            prompt.system.len(),
            prompt.user.len(),
            self.timeout
        );

        match tokio::time::timeout(self.timeout, self.adapter.invoke(prompt)).await {
            Err(_) => {
                warn!("{} timed out after {:?}", self.adapter.name(), self.timeout);
                Err(AnalysisError::ModelTimeout(self.timeout))
            }
            Ok(Err(e)) => {
                warn!("{} call failed: {}", self.adapter.name(), e);
                Err(e.into())
            }
            Ok(Ok(text)) => {
                debug!("{} returned {} chars", self.adapter.name(), text.len());
                Ok(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(std::result::Result<String, ModelError>);

    #[async_trait]
    impl ModelAdapter for Fixed {
        async fn invoke(&self, _prompt: &Prompt) -> std::result::Result<String, ModelError> {
            self.0.clone()
        }
    }

    struct Slow;

    #[async_trait]
    impl ModelAdapter for Slow {
        async fn invoke(&self, _prompt: &Prompt) -> std::result::Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("{}".to_string())
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "s".into(),
            user: "u".into(),
        }
    }

    #[tokio::test]
    async fn test_returns_raw_text() {
        let invoker = AnalysisInvoker::new(
            Arc::new(Fixed(Ok("Sure! {\"a\": 1}".into()))),
            DEFAULT_MODEL_TIMEOUT,
        );
        assert_eq!(invoker.invoke(&prompt()).await.unwrap(), "Sure! {\"a\": 1}");
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let invoker = AnalysisInvoker::new(Arc::new(Slow), Duration::from_millis(30));
        let err = invoker.invoke(&prompt()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ModelTimeout(d) if d == Duration::from_millis(30)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_adapter_errors_mapped() {
        let invoker = AnalysisInvoker::new(
            Arc::new(Fixed(Err(ModelError::Unavailable("rate limited".into())))),
            DEFAULT_MODEL_TIMEOUT,
        );
        assert!(matches!(
            invoker.invoke(&prompt()).await,
            Err(AnalysisError::ModelUnavailable(reason)) if reason == "rate limited"
        ));
    }
}
