use crate::error::{AnalysisError, Result};
use crate::prompts::{
    ANALYSIS_SYSTEM_PROMPT, DOCUMENT_SECTION_HEADER, FORMAT_DIRECTIVE_HEADER, QA_SYSTEM_PROMPT,
};
use crate::session::QaExchange;
use crate::template::{FieldKind, FieldSchema, FieldSpec, Template};
use crate::validator::AnalysisResult;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker a template may place where the document text belongs.
pub const DOCUMENT_MARKER: &str = "{{document}}";

pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 100_000;

/// A model-facing request: standing instructions plus the user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct PromptCompiler {
    max_document_chars: usize,
}

impl Default for PromptCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DOCUMENT_CHARS)
    }
}

impl PromptCompiler {
    pub fn new(max_document_chars: usize) -> Self {
        Self { max_document_chars }
    }

    pub fn max_document_chars(&self) -> usize {
        self.max_document_chars
    }

    /// Merges the template instructions with the document text and appends
    /// the JSON formatting directive. The text is embedded verbatim.
    pub fn compile(&self, template: &Template, document_text: &str) -> Result<Prompt> {
        self.check_document(document_text)?;

        let instructions = template.prompt_template().trim_end();
        let mut user = if instructions.contains(DOCUMENT_MARKER) {
            instructions.replacen(DOCUMENT_MARKER, &document_section(document_text), 1)
        } else {
            format!("{}\n\n{}", instructions, document_section(document_text))
        };

        user.push_str("\n\n");
        user.push_str(&format_directive(template.schema())?);

        debug!(
            "Compiled prompt for template '{}': {} document chars, {} prompt chars",
            template.id(),
            document_text.chars().count(),
            user.len()
        );

        Ok(Prompt {
            system: ANALYSIS_SYSTEM_PROMPT.trim().to_string(),
            user,
        })
    }

    /// Builds a free-form question prompt over the stored document, the
    /// current analysis (if any) and recent exchanges.
    pub fn compile_question(
        &self,
        document_text: &str,
        analysis: Option<&AnalysisResult>,
        history: &[QaExchange],
        question: &str,
    ) -> Result<Prompt> {
        self.check_document(document_text)?;
        let question = question.trim();
        if question.is_empty() {
            return Err(AnalysisError::InvalidRequest("question is empty".to_string()));
        }

        let mut user = format!("Based on this document:\n{}", document_section(document_text));

        if let Some(result) = analysis {
            user.push_str(&format!(
                "\n\n## STRUCTURED ANALYSIS ({})\n{}",
                result.template_name,
                serde_json::to_string_pretty(&result.data)?
            ));
            if result.incomplete {
                user.push_str(&format!(
                    "\nNote: the analysis is incomplete; missing fields: {}",
                    result.missing_fields.join(", ")
                ));
            }
        }

        if !history.is_empty() {
            user.push_str("\n\n## EARLIER QUESTIONS");
            for exchange in history {
                user.push_str(&format!(
                    "\nQ: {}\nA: {}",
                    exchange.question.trim(),
                    exchange.answer.trim()
                ));
            }
        }

        user.push_str(&format!("\n\nAnswer this question:\n{}", question));

        Ok(Prompt {
            system: QA_SYSTEM_PROMPT.trim().to_string(),
            user,
        })
    }

    /// Rejects empty text and text longer than the configured limit.
    pub fn check_document(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(AnalysisError::EmptyDocument);
        }
        let length = text.chars().count();
        if length > self.max_document_chars {
            return Err(AnalysisError::DocumentTooLarge {
                length,
                limit: self.max_document_chars,
            });
        }
        Ok(())
    }
}

fn document_section(text: &str) -> String {
    format!("{}\n<document>\n{}\n</document>", DOCUMENT_SECTION_HEADER, text)
}

pub fn format_directive(schema: &FieldSchema) -> Result<String> {
    let skeleton = serde_json::to_string_pretty(&response_skeleton(schema))?;
    Ok(format!("{}{}", FORMAT_DIRECTIVE_HEADER.trim_start(), skeleton))
}

/// JSON skeleton of the expected answer with type descriptions as values.
pub fn response_skeleton(schema: &FieldSchema) -> Value {
    let mut map = Map::new();
    for (name, spec) in schema {
        map.insert(name.clone(), describe(spec));
    }
    Value::Object(map)
}

fn describe(spec: &FieldSpec) -> Value {
    let mut value = match &spec.kind {
        FieldKind::Object { fields } => return response_skeleton(fields),
        FieldKind::List { items } => {
            let item = items
                .as_deref()
                .map(describe)
                .unwrap_or_else(|| Value::String("value".to_string()));
            return Value::Array(vec![item]);
        }
        FieldKind::Number { min, max } => match (min, max) {
            (Some(lo), Some(hi)) => format!("number {}-{}", lo, hi),
            (Some(lo), None) => format!("number >= {}", lo),
            (None, Some(hi)) => format!("number <= {}", hi),
            (None, None) => "number".to_string(),
        },
        FieldKind::Text => "string".to_string(),
        FieldKind::Date => "date string YYYY-MM-DD".to_string(),
    };
    if spec.nullable {
        value.push_str(" or null");
    }
    if let Some(description) = &spec.description {
        value.push_str(&format!(" ({})", description));
    }
    Value::String(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TemplateStore;
    use chrono::Utc;
    use serde_json::json;

    fn template(raw: &str) -> Template {
        Template::from_json_str("t", raw).unwrap()
    }

    #[test]
    fn test_document_inserted_at_marker() {
        let t = template(
            r#"{ "name": "T", "prompt_template": "Before\n{{document}}\nAfter",
                 "visualization": { "s": { "type": "gauge", "field": "score", "min": 0, "max": 10 } } }"#,
        );
        let prompt = PromptCompiler::default()
            .compile(&t, "Revenue was $4.2M in FY2023.")
            .unwrap();
        let before = prompt.user.find("Before").unwrap();
        let doc = prompt.user.find("Revenue was $4.2M in FY2023.").unwrap();
        let after = prompt.user.find("After").unwrap();
        assert!(before < doc && doc < after);
        assert!(!prompt.user.contains(DOCUMENT_MARKER));
    }

    #[test]
    fn test_document_appended_without_marker() {
        let t = template(
            r#"{ "name": "T", "prompt_template": "Summarize.",
                 "visualization": { "b": { "type": "bar", "fields": ["a"] } } }"#,
        );
        let prompt = PromptCompiler::default().compile(&t, "text body").unwrap();
        assert!(prompt.user.starts_with("Summarize."));
        assert!(prompt.user.find("text body").unwrap() > prompt.user.find("Summarize.").unwrap());
    }

    #[test]
    fn test_directive_always_appended_with_skeleton() {
        let store = TemplateStore::builtin();
        let financial = store.load("financial").unwrap();
        let prompt = PromptCompiler::default().compile(&financial, "doc").unwrap();
        let directive_at = prompt.user.find("RESPONSE FORMAT").unwrap();
        assert!(directive_at > prompt.user.find("doc").unwrap());
        assert!(prompt.user.contains("\"credit_score\": \"number 0-100\""));
        assert!(prompt.user.contains("\"revenue\": \"number or null\""));
    }

    #[test]
    fn test_document_too_large() {
        let t = template(
            r#"{ "name": "T", "prompt_template": "x",
                 "visualization": { "b": { "type": "bar", "fields": ["a"] } } }"#,
        );
        let compiler = PromptCompiler::new(10);
        let err = compiler.compile(&t, "this is definitely longer").unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::DocumentTooLarge { length: 25, limit: 10 }
        ));
        assert!(compiler.compile(&t, "short").is_ok());
    }

    #[test]
    fn test_empty_document_rejected() {
        let t = template(
            r#"{ "name": "T", "prompt_template": "x",
                 "visualization": { "b": { "type": "bar", "fields": ["a"] } } }"#,
        );
        assert!(matches!(
            PromptCompiler::default().compile(&t, "  \n "),
            Err(AnalysisError::EmptyDocument)
        ));
    }

    #[test]
    fn test_skeleton_shapes() {
        let mut fields = FieldSchema::new();
        fields.insert("parties".into(), FieldSpec::list(Some(FieldSpec::text())));
        fields.insert("signed".into(), FieldSpec::date().nullable());
        let mut schema = FieldSchema::new();
        schema.insert("classification".into(), FieldSpec::object(fields));

        assert_eq!(
            response_skeleton(&schema),
            json!({
                "classification": {
                    "parties": ["string"],
                    "signed": "date string YYYY-MM-DD or null"
                }
            })
        );
    }

    #[test]
    fn test_question_prompt_includes_context() {
        let result = AnalysisResult {
            template_id: "financial".into(),
            template_name: "Financial Analysis".into(),
            created_at: Utc::now(),
            data: json!({ "credit_score": 72 }),
            incomplete: false,
            truncated: false,
            missing_fields: vec![],
            issues: vec![],
        };
        let history = vec![QaExchange::new("What was revenue?", "About $4.2M.")];
        let prompt = PromptCompiler::default()
            .compile_question("Annual report text", Some(&result), &history, " Is debt high? ")
            .unwrap();
        assert!(prompt.user.contains("Annual report text"));
        assert!(prompt.user.contains("\"credit_score\": 72"));
        assert!(prompt.user.contains("Q: What was revenue?"));
        assert!(prompt.user.ends_with("Is debt high?"));
    }

    #[test]
    fn test_empty_question_rejected() {
        let err = PromptCompiler::default()
            .compile_question("doc", None, &[], "   ")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidRequest(_)));
    }
}
