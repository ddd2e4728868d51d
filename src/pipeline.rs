//! End-to-end analysis: document text in, validated result and charts out.

use crate::compiler::PromptCompiler;
use crate::config::PipelineConfig;
use crate::dialogue::DialogueHandler;
use crate::error::Result;
use crate::invoker::{AnalysisInvoker, ModelAdapter};
use crate::session::{SessionBackend, SessionId, SessionSnapshot, SessionStore};
use crate::store::TemplateStore;
use crate::template::TemplateSummary;
use crate::validator::{validate, AnalysisResult};
use crate::visualization::{project, RenderableChart, SkippedChart};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalysisEvent {
    Started { session_id: String, template_id: String },
    PromptCompiled { prompt_chars: usize },
    AwaitingModel,
    Validating,
    Incomplete { missing_fields: Vec<String> },
    ChartsProjected { rendered: usize, skipped: usize },
    Completed,
    Failed { reason: String },
}

/// What one analysis produced: the stored result plus its charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub session_id: SessionId,
    pub result: Arc<AnalysisResult>,
    /// Renderable charts in the template's declared order.
    pub charts: Vec<RenderableChart>,
    pub skipped: Vec<SkippedChart>,
}

impl AnalysisReport {
    pub fn is_incomplete(&self) -> bool {
        self.result.incomplete
    }

    pub fn missing_sections(&self) -> Vec<&str> {
        self.result.missing_sections()
    }
}

pub struct AnalysisPipeline {
    templates: Arc<TemplateStore>,
    sessions: Arc<SessionStore>,
    invoker: AnalysisInvoker,
    compiler: PromptCompiler,
    dialogue: DialogueHandler,
    config: PipelineConfig,
}

impl AnalysisPipeline {
    /// A pipeline with in-memory sessions.
    pub fn new(
        templates: Arc<TemplateStore>,
        adapter: Arc<dyn ModelAdapter>,
        config: PipelineConfig,
    ) -> Self {
        let sessions = SessionStore::in_memory().with_ttl(config.session_ttl);
        Self::with_sessions(templates, adapter, Arc::new(sessions), config)
    }

    pub fn with_session_backend(
        templates: Arc<TemplateStore>,
        adapter: Arc<dyn ModelAdapter>,
        backend: Arc<dyn SessionBackend>,
        config: PipelineConfig,
    ) -> Self {
        let sessions = SessionStore::new(backend).with_ttl(config.session_ttl);
        Self::with_sessions(templates, adapter, Arc::new(sessions), config)
    }

    fn with_sessions(
        templates: Arc<TemplateStore>,
        adapter: Arc<dyn ModelAdapter>,
        sessions: Arc<SessionStore>,
        config: PipelineConfig,
    ) -> Self {
        let invoker = AnalysisInvoker::new(adapter, config.model_timeout);
        let compiler = PromptCompiler::new(config.max_document_chars);
        let dialogue = DialogueHandler::new(Arc::clone(&sessions), invoker.clone(), compiler.clone())
            .with_history_window(config.qa_history_window);
        Self {
            templates,
            sessions,
            invoker,
            compiler,
            dialogue,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn templates(&self) -> Vec<TemplateSummary> {
        self.templates.list()
    }

    /// Starts a session for `text`. Text that could never be analyzed is
    /// rejected here rather than at analysis time.
    pub async fn upload(&self, text: &str) -> Result<SessionId> {
        self.compiler.check_document(text)?;
        self.sessions.create(text).await
    }

    /// Swaps the session's document, discarding its analysis and history.
    pub async fn replace_document(&self, session_id: &SessionId, text: &str) -> Result<SessionSnapshot> {
        self.compiler.check_document(text)?;
        let _guard = self.sessions.lock(session_id).await?;
        self.sessions.put(session_id, text).await
    }

    pub async fn analyze(&self, session_id: &SessionId, template_id: &str) -> Result<AnalysisReport> {
        self.analyze_with_progress(session_id, template_id, None).await
    }

    /// Uploads `text` into a fresh session and analyzes it.
    pub async fn analyze_document(&self, text: &str, template_id: &str) -> Result<AnalysisReport> {
        self.templates.load(template_id)?;
        let session_id = self.upload(text).await?;
        self.analyze(&session_id, template_id).await
    }

    pub async fn analyze_with_progress(
        &self,
        session_id: &SessionId,
        template_id: &str,
        progress: Option<Sender<AnalysisEvent>>,
    ) -> Result<AnalysisReport> {
        let outcome = self.run_analysis(session_id, template_id, &progress).await;
        if let Err(e) = &outcome {
            self.send_event(
                &progress,
                AnalysisEvent::Failed {
                    reason: e.to_string(),
                },
            )
            .await;
        }
        outcome
    }

    async fn run_analysis(
        &self,
        session_id: &SessionId,
        template_id: &str,
        progress: &Option<Sender<AnalysisEvent>>,
    ) -> Result<AnalysisReport> {
        self.send_event(
            progress,
            AnalysisEvent::Started {
                session_id: session_id.to_string(),
                template_id: template_id.to_string(),
            },
        )
        .await;

        let template = self.templates.load(template_id)?;

        // Held until the result is attached so a second analysis or question
        // on this session waits for this one.
        let _guard = self.sessions.lock(session_id).await?;
        let session = self.sessions.get(session_id).await?;

        let prompt = self.compiler.compile(&template, &session.document_text)?;
        self.send_event(
            progress,
            AnalysisEvent::PromptCompiled {
                prompt_chars: prompt.user.chars().count(),
            },
        )
        .await;

        info!(
            "Analyzing session {} with template '{}'",
            session_id,
            template.id()
        );
        self.send_event(progress, AnalysisEvent::AwaitingModel).await;
        let raw = self.invoker.invoke(&prompt).await?;

        self.send_event(progress, AnalysisEvent::Validating).await;
        let result = Arc::new(validate(&raw, &template)?);
        if result.incomplete {
            self.send_event(
                progress,
                AnalysisEvent::Incomplete {
                    missing_fields: result.missing_fields.clone(),
                },
            )
            .await;
        }

        let projection = project(&result, &template);
        self.send_event(
            progress,
            AnalysisEvent::ChartsProjected {
                rendered: projection.charts.len(),
                skipped: projection.skipped.len(),
            },
        )
        .await;

        self.sessions
            .attach_result(session_id, Arc::clone(&result))
            .await?;

        info!(
            "Analysis of session {} finished: {} chart(s), incomplete: {}",
            session_id,
            projection.charts.len(),
            result.incomplete
        );
        self.send_event(progress, AnalysisEvent::Completed).await;

        Ok(AnalysisReport {
            session_id: session_id.clone(),
            result,
            charts: projection.charts,
            skipped: projection.skipped,
        })
    }

    pub async fn ask(&self, session_id: &SessionId, question: &str) -> Result<String> {
        self.dialogue.ask(session_id, question).await
    }

    pub async fn session(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        self.sessions.get(session_id).await
    }

    pub async fn clear_session(&self, session_id: &SessionId) -> Result<bool> {
        self.sessions.clear(session_id).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.sessions.purge_expired().await
    }

    /// Drops all sessions. Call once on shutdown.
    pub async fn shutdown(&self) -> Result<usize> {
        self.sessions.teardown().await
    }

    async fn send_event(&self, sender: &Option<Sender<AnalysisEvent>>, event: AnalysisEvent) {
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}
