use crate::error::Result;
use crate::extract::extract_json_object;
use crate::path::join;
use crate::template::{FieldKind, FieldSchema, FieldSpec, Template};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    /// A required field is absent.
    Missing,
    /// The field is null but not declared nullable. It is removed.
    Null,
    /// The value has the wrong type and could not be coerced. It is removed.
    TypeMismatch { expected: String, found: String },
    /// A number outside its declared range was pulled to the nearest bound.
    Clamped { original: f64, clamped: f64 },
    /// The value was converted to the declared type (e.g. "1,200" to 1200).
    Coerced { original: Value },
    /// An invalid list element was removed; the rest of the list is kept.
    DroppedItem { found: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub path: String,
    #[serde(flatten)]
    pub kind: IssueKind,
}

/// Validated output of one analysis run. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub template_id: String,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
    /// Normalized data tree. Undeclared fields are passed through untouched.
    pub data: Value,
    /// One or more required fields could not be extracted, or the output was truncated.
    pub incomplete: bool,
    /// The model output stopped mid-object and was recovered.
    pub truncated: bool,
    /// Paths of required fields that are absent from `data`.
    pub missing_fields: Vec<String>,
    pub issues: Vec<ValidationIssue>,
}

impl AnalysisResult {
    pub fn clamped_fields(&self) -> Vec<&str> {
        self.issues
            .iter()
            .filter(|i| matches!(i.kind, IssueKind::Clamped { .. }))
            .map(|i| i.path.as_str())
            .collect()
    }

    /// True when anything was missing, clamped, coerced or dropped.
    pub fn is_flagged(&self) -> bool {
        self.incomplete || !self.issues.is_empty()
    }

    /// Top-level sections with at least one missing field, in schema order.
    pub fn missing_sections(&self) -> Vec<&str> {
        let mut sections: Vec<&str> = Vec::new();
        for path in &self.missing_fields {
            let section = path.split('.').next().unwrap_or(path.as_str());
            if !sections.contains(&section) {
                sections.push(section);
            }
        }
        sections
    }
}

/// Parses raw model output and checks it against the template's schema.
///
/// Only a total absence of JSON (`NoJsonFound`) or unparseable JSON
/// (`JsonParseError`) is an error; every shape problem below the root is
/// recorded on the result instead.
pub fn validate(raw: &str, template: &Template) -> Result<AnalysisResult> {
    validate_at(raw, template, Utc::now())
}

/// [`validate`] with an explicit timestamp; output depends only on the inputs.
pub fn validate_at(raw: &str, template: &Template, created_at: DateTime<Utc>) -> Result<AnalysisResult> {
    let extracted = extract_json_object(raw)?;
    let mut data = Value::Object(extracted.object);
    let schema = template.schema_for(&data);

    let mut walker = Walker::default();
    if let Value::Object(object) = &mut data {
        walker.walk_object(object, &schema, "");
    }

    let incomplete = extracted.truncated || !walker.missing.is_empty();
    if incomplete {
        warn!(
            "Analysis for template '{}' is incomplete: missing [{}]{}",
            template.id(),
            walker.missing.join(", "),
            if extracted.truncated { " (truncated output)" } else { "" }
        );
    }
    debug!(
        "Validated output for template '{}': {} top-level field(s), {} issue(s)",
        template.id(),
        data.as_object().map_or(0, Map::len),
        walker.issues.len()
    );

    Ok(AnalysisResult {
        template_id: template.id().to_string(),
        template_name: template.name().to_string(),
        created_at,
        data,
        incomplete,
        truncated: extracted.truncated,
        missing_fields: walker.missing,
        issues: walker.issues,
    })
}

struct Mismatch {
    expected: &'static str,
    found: &'static str,
}

#[derive(Default)]
struct Walker {
    missing: Vec<String>,
    issues: Vec<ValidationIssue>,
}

impl Walker {
    fn record(&mut self, path: String, kind: IssueKind) {
        self.issues.push(ValidationIssue { path, kind });
    }

    fn mark_missing(&mut self, path: String, kind: IssueKind, required: bool) {
        if required {
            self.missing.push(path.clone());
        }
        self.record(path, kind);
    }

    fn walk_object(&mut self, object: &mut Map<String, Value>, schema: &FieldSchema, parent: &str) {
        for (name, spec) in schema {
            let path = join(parent, name);
            let outcome = match object.get_mut(name) {
                None => {
                    if spec.required {
                        self.mark_missing(path, IssueKind::Missing, true);
                    }
                    continue;
                }
                Some(Value::Null) if spec.nullable => continue,
                Some(Value::Null) => Err(None),
                Some(value) => self.check(value, spec, &path).map_err(Some),
            };
            match outcome {
                Ok(()) => {}
                Err(None) => {
                    object.remove(name);
                    self.mark_missing(path, IssueKind::Null, spec.required);
                }
                Err(Some(mismatch)) => {
                    object.remove(name);
                    let kind = IssueKind::TypeMismatch {
                        expected: mismatch.expected.to_string(),
                        found: mismatch.found.to_string(),
                    };
                    self.mark_missing(path, kind, spec.required);
                }
            }
        }
    }

    /// Checks and normalizes `value` in place.
    fn check(&mut self, value: &mut Value, spec: &FieldSpec, path: &str) -> std::result::Result<(), Mismatch> {
        match &spec.kind {
            FieldKind::Number { min, max } => self.check_number(value, *min, *max, path),
            FieldKind::Text => match value {
                Value::String(_) => Ok(()),
                Value::Number(_) | Value::Bool(_) => {
                    let original = value.clone();
                    *value = Value::String(original.to_string());
                    self.record(path.to_string(), IssueKind::Coerced { original });
                    Ok(())
                }
                other => Err(mismatch("text", other)),
            },
            FieldKind::Date => self.check_date(value, path),
            FieldKind::List { items } => match value {
                Value::Array(elements) => {
                    if let Some(items) = items {
                        self.check_items(elements, items, path);
                    }
                    Ok(())
                }
                Value::Object(_) => Err(mismatch("list", value)),
                _ => {
                    // A lone scalar where a list was expected becomes a one-element list.
                    let original = value.clone();
                    let mut element = value.take();
                    if let Some(items) = items {
                        self.check(&mut element, items, path)?;
                    }
                    *value = Value::Array(vec![element]);
                    self.record(path.to_string(), IssueKind::Coerced { original });
                    Ok(())
                }
            },
            FieldKind::Object { fields } => match value {
                Value::Object(map) => {
                    self.walk_object(map, fields, path);
                    Ok(())
                }
                other => Err(mismatch("object", other)),
            },
        }
    }

    fn check_items(&mut self, elements: &mut Vec<Value>, items: &FieldSpec, path: &str) {
        let mut kept = Vec::with_capacity(elements.len());
        for (index, mut element) in std::mem::take(elements).into_iter().enumerate() {
            let item_path = format!("{}.{}", path, index);
            let outcome = if element.is_null() {
                if items.nullable {
                    Ok(())
                } else {
                    Err(mismatch("non-null item", &element))
                }
            } else {
                self.check(&mut element, items, &item_path)
            };
            match outcome {
                Ok(()) => kept.push(element),
                Err(m) => self.record(
                    item_path,
                    IssueKind::DroppedItem {
                        found: m.found.to_string(),
                    },
                ),
            }
        }
        *elements = kept;
    }

    fn check_number(
        &mut self,
        value: &mut Value,
        min: Option<f64>,
        max: Option<f64>,
        path: &str,
    ) -> std::result::Result<(), Mismatch> {
        let number = match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| mismatch("number", value))?,
            Value::String(s) => {
                let parsed = parse_number(s).ok_or(Mismatch {
                    expected: "number",
                    found: "text",
                })?;
                let original = value.clone();
                *value = number_value(parsed).ok_or_else(|| mismatch("number", &original))?;
                self.record(path.to_string(), IssueKind::Coerced { original });
                parsed
            }
            other => return Err(mismatch("number", other)),
        };

        let clamped = match (min, max) {
            (Some(lo), _) if number < lo => lo,
            (_, Some(hi)) if number > hi => hi,
            _ => return Ok(()),
        };
        let replacement = number_value(clamped).ok_or(Mismatch {
            expected: "number",
            found: "number",
        })?;
        *value = replacement;
        self.record(
            path.to_string(),
            IssueKind::Clamped {
                original: number,
                clamped,
            },
        );
        Ok(())
    }

    fn check_date(&mut self, value: &mut Value, path: &str) -> std::result::Result<(), Mismatch> {
        let Value::String(text) = value else {
            return Err(mismatch("date", value));
        };
        let trimmed = text.trim().to_string();
        let padded = trimmed.len() != text.len();
        if NaiveDate::parse_from_str(&trimmed, DATE_FORMAT).is_ok() {
            if padded {
                let original = value.clone();
                *value = Value::String(trimmed);
                self.record(path.to_string(), IssueKind::Coerced { original });
            }
            return Ok(());
        }
        // Timestamps are accepted and reduced to their calendar date.
        match DateTime::parse_from_rfc3339(&trimmed) {
            Ok(timestamp) => {
                let original = value.clone();
                *value = Value::String(timestamp.date_naive().format(DATE_FORMAT).to_string());
                self.record(path.to_string(), IssueKind::Coerced { original });
                Ok(())
            }
            Err(_) => Err(Mismatch {
                expected: "date",
                found: "text",
            }),
        }
    }
}

fn mismatch(expected: &'static str, found: &Value) -> Mismatch {
    Mismatch {
        expected,
        found: json_type(found),
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Integral values stay integers so clamped and coerced numbers serialize cleanly.
fn number_value(x: f64) -> Option<Value> {
    if x.fract() == 0.0 && x.abs() < 9_007_199_254_740_992.0 {
        Some(Value::Number(Number::from(x as i64)))
    } else {
        Number::from_f64(x).map(Value::Number)
    }
}

/// Accepts "1,200", "$4.5", "45%", "(300)" and similar renderings of a number.
fn parse_number(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    let negative_parens = text.starts_with('(') && text.ends_with(')');
    if negative_parens {
        text = &text[1..text.len() - 1];
    }
    let cleaned: String = text
        .trim_start_matches(['$', '€', '£', '¥'])
        .trim_end_matches('%')
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' '))
        .collect();
    let parsed: f64 = cleaned.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    Some(if negative_parens { -parsed } else { parsed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TemplateStore;
    use serde_json::json;
    use std::sync::Arc;

    fn financial() -> Arc<Template> {
        TemplateStore::builtin().load("financial").unwrap()
    }

    fn complete_financial() -> Value {
        json!({
            "metrics": {
                "revenue": 120.5,
                "net_income": 14,
                "total_assets": 300,
                "total_liabilities": 180.25,
                "cash_flow": null
            },
            "health_assessment": "Stable with moderate leverage.",
            "risk_factors": ["Customer concentration"],
            "recommendations": ["Diversify revenue"],
            "credit_score": 72,
            "ratios": { "debt_to_equity": 1.5, "current_ratio": 1.2, "quick_ratio": 0.9 },
            "analysis_confidence": 85
        })
    }

    #[test]
    fn test_well_formed_output_round_trips() {
        let expected = complete_financial();
        let result = validate(&expected.to_string(), &financial()).unwrap();
        assert!(!result.incomplete);
        assert!(result.issues.is_empty(), "{:?}", result.issues);
        assert_eq!(result.data, expected);
        assert_eq!(result.template_id, "financial");
    }

    #[test]
    fn test_missing_required_field_is_partial() {
        let mut data = complete_financial();
        data.as_object_mut().unwrap().remove("credit_score");
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert!(result.incomplete);
        assert_eq!(result.missing_fields, vec!["credit_score"]);
        assert_eq!(result.data["health_assessment"], json!("Stable with moderate leverage."));
        assert_eq!(result.data["metrics"]["revenue"], json!(120.5));
    }

    #[test]
    fn test_optional_field_may_be_absent() {
        let mut data = complete_financial();
        data.as_object_mut().unwrap().remove("analysis_confidence");
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert!(!result.incomplete);
    }

    #[test]
    fn test_out_of_range_score_is_clamped_and_flagged() {
        let mut data = complete_financial();
        data["credit_score"] = json!(140);
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert_eq!(result.data["credit_score"], json!(100));
        assert_eq!(result.clamped_fields(), vec!["credit_score"]);
        assert!(result.is_flagged());
        assert!(!result.incomplete);

        data["credit_score"] = json!(-3.5);
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert_eq!(result.data["credit_score"], json!(0));
    }

    #[test]
    fn test_extra_fields_pass_through() {
        let mut data = complete_financial();
        data["industry"] = json!("Retail");
        data["metrics"]["ebitda"] = json!(30);
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert_eq!(result.data["industry"], json!("Retail"));
        assert_eq!(result.data["metrics"]["ebitda"], json!(30));
        assert!(!result.incomplete);
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let mut data = complete_financial();
        data["metrics"]["revenue"] = json!("$1,200.5");
        data["credit_score"] = json!("68%");
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert_eq!(result.data["metrics"]["revenue"], json!(1200.5));
        assert_eq!(result.data["credit_score"], json!(68));
        assert!(result
            .issues
            .iter()
            .any(|i| i.path == "metrics.revenue" && matches!(i.kind, IssueKind::Coerced { .. })));
    }

    #[test]
    fn test_type_mismatch_removes_field() {
        let mut data = complete_financial();
        data["credit_score"] = json!("excellent");
        data["ratios"] = json!(["not", "an", "object"]);
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert!(result.incomplete);
        assert_eq!(result.missing_fields, vec!["credit_score", "ratios"]);
        assert!(result.data.get("credit_score").is_none());
        assert_eq!(result.missing_sections(), vec!["credit_score", "ratios"]);
    }

    #[test]
    fn test_null_for_non_nullable_field() {
        let mut data = complete_financial();
        data["health_assessment"] = Value::Null;
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert!(result.incomplete);
        assert_eq!(result.missing_fields, vec!["health_assessment"]);
        assert!(result.data.get("health_assessment").is_none());
    }

    #[test]
    fn test_nested_missing_field_path() {
        let mut data = complete_financial();
        data["ratios"].as_object_mut().unwrap().remove("quick_ratio");
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert_eq!(result.missing_fields, vec!["ratios.quick_ratio"]);
        assert_eq!(result.missing_sections(), vec!["ratios"]);
    }

    #[test]
    fn test_invalid_list_items_dropped() {
        let mut data = complete_financial();
        data["risk_factors"] = json!(["Leverage", {"nested": true}, "FX exposure"]);
        data["recommendations"] = json!("Cut costs");
        let result = validate(&data.to_string(), &financial()).unwrap();
        assert_eq!(result.data["risk_factors"], json!(["Leverage", "FX exposure"]));
        assert_eq!(result.data["recommendations"], json!(["Cut costs"]));
        assert!(!result.incomplete);
    }

    #[test]
    fn test_dates_validated_and_normalized() {
        let store = TemplateStore::builtin();
        let legal = store.load("legal").unwrap();
        let raw = json!({
            "classification": { "effective_date": "2024-03-01T09:30:00Z" }
        });
        let result = validate(&raw.to_string(), &legal).unwrap();
        assert_eq!(
            result.data["classification"]["effective_date"],
            json!("2024-03-01")
        );

        let raw = json!({ "classification": { "effective_date": "March 1st" } });
        let result = validate(&raw.to_string(), &legal).unwrap();
        assert!(result.missing_fields.contains(&"classification.effective_date".to_string()));
    }

    #[test]
    fn test_prose_wrapped_output() {
        let template = Template::from_json_str(
            "score",
            r#"{ "name": "Score", "prompt_template": "x",
                 "visualization": { "g": { "type": "gauge", "field": "score", "min": 0, "max": 100 } } }"#,
        )
        .unwrap();
        let result = validate("Here is the result: {\"score\": 72} Thanks.", &template).unwrap();
        assert_eq!(result.data, json!({ "score": 72 }));
        assert!(!result.incomplete);
    }

    #[test]
    fn test_truncated_output_is_incomplete() {
        let raw = r#"{"metrics": {"revenue": 10, "net_income": 1, "total_assets": 5, "total_liabilities": 2, "cash_flow": 1}, "health_assessment": "Weak", "risk_fac"#;
        let result = validate(raw, &financial()).unwrap();
        assert!(result.truncated);
        assert!(result.incomplete);
        assert_eq!(result.data["health_assessment"], json!("Weak"));
        assert!(result.missing_fields.contains(&"credit_score".to_string()));
    }

    const SCHEMALESS_FINANCIAL: &str = r#"{
        "name": "Financial Analysis",
        "prompt_template": "Analyze this financial document. Return metrics (revenue, net_income) and a credit_score.",
        "visualization": {
            "metrics": { "type": "bar", "fields": ["revenue", "net_income"], "title": "Key Metrics" },
            "score": { "type": "gauge", "field": "credit_score", "min": 0, "max": 100 }
        }
    }"#;

    #[test]
    fn test_schemaless_fields_accepted_under_chart_object() {
        let template = Template::from_json_str("financial", SCHEMALESS_FINANCIAL).unwrap();
        let raw = r#"{"metrics": {"revenue": "10", "net_income": 2}, "credit_score": 70}"#;
        let result = validate(raw, &template).unwrap();

        assert!(!result.incomplete, "{:?}", result.missing_fields);
        assert_eq!(result.data["metrics"]["revenue"], json!(10));
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].path, "metrics.revenue");

        let root = r#"{"revenue": 10, "net_income": 2, "credit_score": 70}"#;
        assert!(!validate(root, &template).unwrap().incomplete);

        let neither = r#"{"credit_score": 70}"#;
        let result = validate(neither, &template).unwrap();
        assert_eq!(result.missing_fields, vec!["revenue", "net_income"]);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let raw = r#"Result: {"credit_score": 250, "metrics": {"revenue": "12"}}"#;
        let at = Utc::now();
        let first = validate_at(raw, &financial(), at).unwrap();
        let second = validate_at(raw, &financial(), at).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_number_variants() {
        assert_eq!(parse_number("1,200"), Some(1200.0));
        assert_eq!(parse_number("$4.5"), Some(4.5));
        assert_eq!(parse_number("45%"), Some(45.0));
        assert_eq!(parse_number("(300)"), Some(-300.0));
        assert_eq!(parse_number("n/a"), None);
    }
}
