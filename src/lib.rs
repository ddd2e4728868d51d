//! # Financial Report Analyzer
//!
//! Template-driven analysis of document text with a language model.
//!
//! ## Core Concepts
//!
//! - **Template**: analysis instructions, the expected answer shape and the
//!   charts to draw from it. Templates are plain JSON files validated on load.
//! - **Analysis**: the template and document are compiled into one prompt, the
//!   model's free-form reply is searched for a JSON object, and that object is
//!   checked against the template. Missing fields do not fail the analysis;
//!   they mark the result `incomplete`.
//! - **Charts**: each chart declared by the template is projected from the
//!   result on its own. A chart whose data is missing is skipped with a reason.
//! - **Session**: a document, its latest analysis and the questions asked
//!   about it. Sessions live in memory unless another backend is supplied.
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_report_analyzer::*;
//! use std::sync::Arc;
//!
//! let pipeline = AnalysisPipeline::new(
//!     Arc::new(TemplateStore::builtin()),
//!     Arc::new(AnthropicClient::from_env()?),
//!     PipelineConfig::from_env()?,
//! );
//!
//! let session = pipeline.upload(&annual_report_text).await?;
//! let report = pipeline.analyze(&session, "financial").await?;
//! for chart in &report.charts {
//!     println!("{}: {} point(s)", chart.title, chart.points.len());
//! }
//! let answer = pipeline.ask(&session, "What drove the change in net income?").await?;
//! ```

pub mod builder;
pub mod compiler;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod extract;
pub mod invoker;
pub mod path;
pub mod pipeline;
pub mod prompts;
pub mod session;
pub mod store;
pub mod template;
pub mod validator;
pub mod visualization;

#[cfg(feature = "anthropic")]
pub mod llm;

pub use builder::{save as save_template, template_id_for, CreatedTemplate, TemplateBuilder};
pub use compiler::{Prompt, PromptCompiler, DOCUMENT_MARKER};
pub use config::PipelineConfig;
pub use dialogue::DialogueHandler;
pub use error::{AnalysisError, ErrorKind, Result};
pub use extract::{extract_json_object, ExtractedJson};
pub use invoker::{AnalysisInvoker, ModelAdapter, ModelError};
pub use path::FieldPath;
pub use pipeline::{AnalysisEvent, AnalysisPipeline, AnalysisReport};
pub use session::{
    InMemorySessionBackend, QaExchange, Session, SessionBackend, SessionId, SessionSnapshot,
    SessionStore,
};
pub use store::TemplateStore;
pub use template::{
    ChartBinding, ChartDescriptor, ChartType, FieldKind, FieldSchema, FieldSpec, Template,
    TemplateDefinition, TemplateSummary,
};
pub use validator::{validate, AnalysisResult, IssueKind, ValidationIssue};
pub use visualization::{
    project, ChartRange, DataPoint, PointValue, Projection, RenderableChart, SkipReason,
    SkippedChart,
};

#[cfg(feature = "anthropic")]
pub use llm::AnthropicClient;
