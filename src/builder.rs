use crate::compiler::Prompt;
use crate::error::{AnalysisError, Result};
use crate::extract::extract_json_object;
use crate::invoker::AnalysisInvoker;
use crate::prompts::TEMPLATE_BUILDER_SYSTEM_PROMPT;
use crate::template::{Template, TemplateDefinition};
use log::info;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// A generated template written to disk.
#[derive(Debug, Clone)]
pub struct CreatedTemplate {
    pub id: String,
    pub path: PathBuf,
    pub definition: TemplateDefinition,
}

/// Drafts new templates from a plain-language description of a document type.
#[derive(Clone)]
pub struct TemplateBuilder {
    invoker: AnalysisInvoker,
}

impl TemplateBuilder {
    pub fn new(invoker: AnalysisInvoker) -> Self {
        Self { invoker }
    }

    /// Asks the model for a template and checks it with the same rules the
    /// template store applies on load.
    pub async fn generate(
        &self,
        description: &str,
        metrics: &str,
        visualizations: &str,
    ) -> Result<TemplateDefinition> {
        if description.trim().is_empty() {
            return Err(AnalysisError::InvalidRequest(
                "template description is empty".to_string(),
            ));
        }

        let schema = TemplateDefinition::schema_as_json()?;
        let prompt = Prompt {
            system: format!(
                "{}\n## TEMPLATE JSON SCHEMA\n{}",
                TEMPLATE_BUILDER_SYSTEM_PROMPT.trim(),
                schema
            ),
            user: format!(
                "Help me create a document analysis template.\n\n\
                 Document Description:\n{}\n\n\
                 Metrics/Data to Extract:\n{}\n\n\
                 Desired Visualizations:\n{}\n\n\
                 Respond with exactly one JSON object matching the template schema.",
                description.trim(),
                metrics.trim(),
                visualizations.trim()
            ),
        };

        let raw = self.invoker.invoke(&prompt).await?;
        let extracted = extract_json_object(&raw)?;
        if extracted.truncated {
            return Err(AnalysisError::malformed(
                "generated",
                "model output ended before the template was complete",
            ));
        }

        let definition: TemplateDefinition = serde_json::from_value(Value::Object(extracted.object))
            .map_err(|e| AnalysisError::malformed("generated", e.to_string()))?;
        let id = template_id_for(&definition.name);
        Template::from_definition(&id, definition.clone())?;

        info!(
            "Generated template '{}' with {} chart(s)",
            id,
            definition.visualization.len()
        );
        Ok(definition)
    }

    /// Generates a template and saves it under `dir`.
    pub async fn create(
        &self,
        description: &str,
        metrics: &str,
        visualizations: &str,
        dir: &Path,
    ) -> Result<CreatedTemplate> {
        let definition = self.generate(description, metrics, visualizations).await?;
        let path = save(&definition, dir)?;
        Ok(CreatedTemplate {
            id: template_id_for(&definition.name),
            path,
            definition,
        })
    }
}

/// Lowercased name with spaces replaced by `_`. Characters that are not
/// safe in a file name are replaced as well.
pub fn template_id_for(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Writes `definition` to `<dir>/<id>.json`, replacing any existing file.
pub fn save(definition: &TemplateDefinition, dir: &Path) -> Result<PathBuf> {
    let id = template_id_for(&definition.name);
    if id.is_empty() {
        return Err(AnalysisError::malformed("generated", "template name is empty"));
    }
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", id));
    fs::write(&path, serde_json::to_string_pretty(definition)?)?;
    info!("Saved template '{}' to {}", id, path.display());
    Ok(path)
}
