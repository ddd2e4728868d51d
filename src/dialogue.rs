use crate::compiler::PromptCompiler;
use crate::config::DEFAULT_QA_HISTORY_WINDOW;
use crate::error::Result;
use crate::invoker::AnalysisInvoker;
use crate::session::{QaExchange, SessionId, SessionStore};
use log::info;
use std::sync::Arc;

/// Answers free-form questions about a session's document.
#[derive(Clone)]
pub struct DialogueHandler {
    sessions: Arc<SessionStore>,
    invoker: AnalysisInvoker,
    compiler: PromptCompiler,
    history_window: usize,
}

impl DialogueHandler {
    pub fn new(sessions: Arc<SessionStore>, invoker: AnalysisInvoker, compiler: PromptCompiler) -> Self {
        Self {
            sessions,
            invoker,
            compiler,
            history_window: DEFAULT_QA_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, exchanges: usize) -> Self {
        self.history_window = exchanges;
        self
    }

    /// Returns the model's answer unmodified and records the exchange.
    ///
    /// The stored analysis is included when one exists, but is not required.
    /// The session is locked for the whole call, so questions and analyses on
    /// one session run one at a time.
    pub async fn ask(&self, session_id: &SessionId, question: &str) -> Result<String> {
        let _guard = self.sessions.lock(session_id).await?;
        let session = self.sessions.get(session_id).await?;

        let prompt = self.compiler.compile_question(
            &session.document_text,
            session.result.as_deref(),
            session.recent_exchanges(self.history_window),
            question,
        )?;

        info!(
            "Answering question for session {} (analysis attached: {})",
            session_id,
            session.result.is_some()
        );
        let answer = self.invoker.invoke(&prompt).await?;

        self.sessions
            .record_exchange(session_id, QaExchange::new(question.trim(), answer.clone()))
            .await?;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Prompt;
    use crate::error::AnalysisError;
    use crate::invoker::{ModelAdapter, ModelError, DEFAULT_MODEL_TIMEOUT};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl ModelAdapter for Recording {
        async fn invoke(&self, prompt: &Prompt) -> std::result::Result<String, ModelError> {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.clone());
            Ok(format!("  answer {}  ", prompts.len()))
        }
    }

    fn handler(model: Arc<Recording>) -> (DialogueHandler, Arc<SessionStore>) {
        let sessions = Arc::new(SessionStore::in_memory());
        let handler = DialogueHandler::new(
            Arc::clone(&sessions),
            AnalysisInvoker::new(model, DEFAULT_MODEL_TIMEOUT),
            PromptCompiler::default(),
        )
        .with_history_window(1);
        (handler, sessions)
    }

    #[tokio::test]
    async fn test_ask_without_analysis() {
        let model = Arc::new(Recording::default());
        let (handler, sessions) = handler(Arc::clone(&model));
        let id = sessions.create("Revenue grew 12% to $4.2M.").await.unwrap();

        let answer = handler.ask(&id, "How much did revenue grow?").await.unwrap();
        assert_eq!(answer, "  answer 1  ");

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].user.contains("Revenue grew 12%"));
        assert!(!prompts[0].user.contains("STRUCTURED ANALYSIS"));
    }

    #[tokio::test]
    async fn test_history_window_and_recording() {
        let model = Arc::new(Recording::default());
        let (handler, sessions) = handler(Arc::clone(&model));
        let id = sessions.create("doc").await.unwrap();

        handler.ask(&id, "first?").await.unwrap();
        handler.ask(&id, "second?").await.unwrap();
        handler.ask(&id, "third?").await.unwrap();

        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.exchanges.len(), 3);
        assert_eq!(session.exchanges[2].answer, "  answer 3  ");

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[2].user.contains("Q: second?"));
        assert!(!prompts[2].user.contains("Q: first?"));
    }

    #[tokio::test]
    async fn test_unknown_session_and_empty_question() {
        let model = Arc::new(Recording::default());
        let (handler, sessions) = handler(Arc::clone(&model));
        assert!(matches!(
            handler.ask(&SessionId::from("missing"), "q").await,
            Err(AnalysisError::SessionNotFound(_))
        ));
        assert_eq!(sessions.tracked_locks(), 0);

        let id = sessions.create("doc").await.unwrap();
        assert!(matches!(
            handler.ask(&id, "  ").await,
            Err(AnalysisError::InvalidRequest(_))
        ));
        assert!(model.prompts.lock().unwrap().is_empty());
    }
}
