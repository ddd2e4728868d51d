use crate::error::{AnalysisError, Result};
use crate::template::{Template, TemplateDefinition, TemplateSummary};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("financial", include_str!("../templates/financial.json")),
    ("legal", include_str!("../templates/legal.json")),
    ("medical", include_str!("../templates/medical.json")),
];

/// Catalogue of validated templates.
///
/// Every definition is validated when it enters the store. A definition that
/// fails validation is kept out of the catalogue and remembered with its
/// reason, so `load` reports `TemplateMalformed` for it instead of
/// `TemplateNotFound`. The store is never mutated once it is shared.
#[derive(Debug, Default, Clone)]
pub struct TemplateStore {
    templates: BTreeMap<String, Arc<Template>>,
    rejected: BTreeMap<String, String>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The financial, legal and medical templates shipped with the crate.
    pub fn builtin() -> Self {
        let mut store = Self::new();
        for (id, raw) in BUILTIN_TEMPLATES {
            store.insert_json(id, raw);
        }
        store
    }

    /// Loads every `*.json` file in `dir`; the file stem is the template id.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();
        store.load_dir(dir)?;
        Ok(store)
    }

    /// Adds the `*.json` definitions found in `dir`, replacing same-id entries.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        entries.sort();

        let mut loaded = 0;
        for path in entries {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Rejecting template '{}': cannot read {}: {}", id, path.display(), e);
                    self.templates.remove(id);
                    self.rejected
                        .insert(id.to_string(), format!("cannot read {}: {}", path.display(), e));
                    continue;
                }
            };
            if self.insert_json(id, &raw) {
                loaded += 1;
            }
        }
        info!(
            "Loaded {} template(s) from {} ({} rejected in total)",
            loaded,
            dir.display(),
            self.rejected.len()
        );
        Ok(loaded)
    }

    /// Validates and stores a definition. Returns whether it was accepted.
    pub fn insert_json(&mut self, id: &str, raw: &str) -> bool {
        self.record(id, Template::from_json_str(id, raw))
    }

    pub fn insert_definition(&mut self, id: &str, definition: TemplateDefinition) -> Result<Arc<Template>> {
        let outcome = Template::from_definition(id, definition);
        self.record(id, outcome);
        self.load(id)
    }

    fn record(&mut self, id: &str, outcome: Result<Template>) -> bool {
        match outcome {
            Ok(template) => {
                debug!(
                    "Template '{}' accepted with {} chart(s)",
                    id,
                    template.charts().len()
                );
                self.rejected.remove(id);
                self.templates.insert(id.to_string(), Arc::new(template));
                true
            }
            Err(e) => {
                warn!("Rejecting template '{}': {}", id, e);
                let details = match e {
                    AnalysisError::TemplateMalformed { details, .. } => details,
                    other => other.to_string(),
                };
                self.templates.remove(id);
                self.rejected.insert(id.to_string(), details);
                false
            }
        }
    }

    pub fn load(&self, id: &str) -> Result<Arc<Template>> {
        if let Some(template) = self.templates.get(id) {
            return Ok(Arc::clone(template));
        }
        match self.rejected.get(id) {
            Some(details) => Err(AnalysisError::malformed(id, details.clone())),
            None => Err(AnalysisError::TemplateNotFound(id.to_string())),
        }
    }

    pub fn list(&self) -> Vec<TemplateSummary> {
        self.templates.values().map(|t| t.summary()).collect()
    }

    /// Ids of definitions that failed validation, with the reason.
    pub fn rejected(&self) -> &BTreeMap<String, String> {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_are_valid() {
        let store = TemplateStore::builtin();
        assert!(store.rejected().is_empty(), "{:?}", store.rejected());
        let ids: Vec<String> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["financial", "legal", "medical"]);

        let financial = store.load("financial").unwrap();
        let charts: Vec<&str> = financial.charts().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(charts, vec!["metrics", "ratios", "score"]);
    }

    #[test]
    fn test_unknown_template() {
        let store = TemplateStore::builtin();
        assert!(matches!(
            store.load("insurance"),
            Err(AnalysisError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_template_is_isolated() {
        let mut store = TemplateStore::builtin();
        let accepted = store.insert_json(
            "broken",
            r#"{ "name": "Broken", "prompt_template": "x",
                 "visualization": { "g": { "type": "gauge", "field": "s", "min": 0 } } }"#,
        );
        assert!(!accepted);
        assert!(matches!(
            store.load("broken"),
            Err(AnalysisError::TemplateMalformed { .. })
        ));
        assert!(store.load("financial").is_ok());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cashflow.json"),
            r#"{ "name": "Cash Flow", "prompt_template": "Summarize cash flow",
                 "visualization": { "flows": { "type": "bar", "fields": ["operating", "investing"], "title": "Flows" } } }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = TemplateStore::from_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("cashflow").unwrap().name(), "Cash Flow");
        assert!(store.rejected().contains_key("bad"));
    }

    #[test]
    fn test_unreadable_file_does_not_abort_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cashflow.json"),
            r#"{ "name": "Cash Flow", "prompt_template": "Summarize cash flow",
                 "visualization": { "flows": { "type": "bar", "fields": ["operating"], "title": "Flows" } } }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("latin1.json"), [0x7b, 0xff, 0xfe, 0x7d]).unwrap();

        let store = TemplateStore::from_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load("cashflow").is_ok());
        assert!(matches!(
            store.load("latin1"),
            Err(AnalysisError::TemplateMalformed { .. })
        ));
    }
}
