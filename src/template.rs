use crate::error::{AnalysisError, Result};
use crate::path::FieldPath;
use indexmap::IndexMap;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Ordered mapping from top-level field name to its declared shape.
pub type FieldSchema = IndexMap<String, FieldSpec>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    #[schemars(description = "Vertical bars, one per numeric field.")]
    Bar,
    #[schemars(description = "Spider chart comparing several numeric fields on one scale.")]
    Radar,
    #[schemars(description = "Single numeric field shown against a fixed min/max range.")]
    Gauge,
    #[schemars(description = "Date fields (YYYY-MM-DD) placed in chronological order.")]
    Timeline,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Radar => "radar",
            ChartType::Gauge => "gauge",
            ChartType::Timeline => "timeline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ChartDescriptor {
    #[serde(rename = "type")]
    #[schemars(description = "Chart type: bar, radar, gauge or timeline")]
    pub chart_type: ChartType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(
        description = "Dotted paths of the fields to plot. A path may omit the chart name when the data holds an object under that name."
    )]
    pub fields: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Single field path. Required for gauge charts.")]
    pub field: Option<String>,

    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Display unit, e.g. 'millions' or '%'")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Lower bound of the gauge range (required for gauge)")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Upper bound of the gauge range (required for gauge)")]
    pub max: Option<f64>,
}

impl ChartDescriptor {
    /// `field` first, then `fields`, in declaration order.
    pub fn field_refs(&self) -> Vec<&str> {
        self.field
            .iter()
            .map(String::as_str)
            .chain(self.fields.iter().map(String::as_str))
            .collect()
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Text,
    #[schemars(description = "Text holding a calendar date in YYYY-MM-DD format")]
    Date,
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<FieldSpec>>,
    },
    Object {
        #[serde(default)]
        fields: FieldSchema,
    },
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Number { .. } => "number",
            FieldKind::Text => "text",
            FieldKind::Date => "date",
            FieldKind::List { .. } => "list",
            FieldKind::Object { .. } => "object",
        }
    }
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub kind: FieldKind,

    #[serde(default = "default_required")]
    #[schemars(description = "Missing required fields mark the analysis incomplete. Defaults to true.")]
    pub required: bool,

    #[serde(default)]
    #[schemars(description = "Whether null is an acceptable value (e.g. 'number or null').")]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
            nullable: false,
            description: None,
        }
    }

    pub fn number() -> Self {
        Self::new(FieldKind::Number {
            min: None,
            max: None,
        })
    }

    pub fn ranged(min: f64, max: f64) -> Self {
        Self::new(FieldKind::Number {
            min: Some(min),
            max: Some(max),
        })
    }

    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    pub fn list(items: Option<FieldSpec>) -> Self {
        Self::new(FieldKind::List {
            items: items.map(Box::new),
        })
    }

    pub fn object(fields: FieldSchema) -> Self {
        Self::new(FieldKind::Object { fields })
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A template as written by its author, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct TemplateDefinition {
    #[schemars(description = "Human readable template name, e.g. 'Financial Analysis'")]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[schemars(
        description = "Analysis instructions for the model. May contain a {{document}} marker; otherwise the document text is appended after the instructions."
    )]
    pub prompt_template: String,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    #[schemars(
        description = "Expected shape of the model's JSON answer. When omitted, the shape is derived from the chart fields."
    )]
    pub schema: FieldSchema,

    #[serde(default)]
    #[schemars(description = "Charts to build from the answer, in display order")]
    pub visualization: IndexMap<String, ChartDescriptor>,
}

impl TemplateDefinition {
    pub fn from_json_str(id: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| AnalysisError::malformed(id, e.to_string()))
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(TemplateDefinition)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::generate_json_schema())
    }
}

/// One chart with its field references resolved to full data paths.
#[derive(Debug, Clone)]
pub struct ChartBinding {
    pub name: String,
    pub descriptor: ChartDescriptor,
    pub paths: Vec<FieldPath>,
    /// No schema was declared, so `paths` are rooted at the top level but the
    /// data may hold them under an object named after the chart instead.
    pub scoped_fallback: bool,
}

impl ChartBinding {
    /// Where `path` lives in `data`: the root first, then the chart's own
    /// object when the binding allows it.
    pub fn locate(&self, data: &Value, path: &FieldPath) -> FieldPath {
        if self.scoped_fallback {
            if let Some((found, _)) = path.resolve(data, &self.name) {
                return found;
            }
        }
        path.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub charts: Vec<String>,
}

/// A validated, immutable template.
#[derive(Debug, Clone)]
pub struct Template {
    id: String,
    definition: TemplateDefinition,
    schema: FieldSchema,
    charts: Vec<ChartBinding>,
}

impl Template {
    pub fn from_json_str(id: &str, raw: &str) -> Result<Self> {
        Self::from_definition(id, TemplateDefinition::from_json_str(id, raw)?)
    }

    /// Validates the definition and computes the effective schema: declared
    /// fields, plus chart fields when no schema is declared, with gauge ranges
    /// folded into the referenced field.
    pub fn from_definition(id: &str, mut definition: TemplateDefinition) -> Result<Self> {
        let malformed = |details: String| AnalysisError::malformed(id, details);

        if id.trim().is_empty() {
            return Err(malformed("template id is empty".to_string()));
        }
        if definition.name.trim().is_empty() {
            return Err(malformed("missing 'name'".to_string()));
        }
        if definition.prompt_template.trim().is_empty() {
            return Err(malformed("missing 'prompt_template'".to_string()));
        }
        check_schema(&definition.schema, "").map_err(malformed)?;

        let declared = !definition.schema.is_empty();
        let mut schema = definition.schema.clone();
        let mut charts = Vec::with_capacity(definition.visualization.len());

        for (name, descriptor) in definition.visualization.iter_mut() {
            if descriptor.title.trim().is_empty() {
                descriptor.title = name.clone();
            }
            let refs = descriptor.field_refs();
            if refs.is_empty() {
                return Err(malformed(format!("chart '{}' references no fields", name)));
            }
            if let (Some(min), Some(max)) = (descriptor.min, descriptor.max) {
                if min.partial_cmp(&max) != Some(std::cmp::Ordering::Less) {
                    return Err(malformed(format!(
                        "chart '{}' has min {} not below max {}",
                        name, min, max
                    )));
                }
            }
            if descriptor.chart_type == ChartType::Gauge {
                if refs.len() != 1 {
                    return Err(malformed(format!(
                        "gauge '{}' must reference exactly one field, found {}",
                        name,
                        refs.len()
                    )));
                }
                if descriptor.range().is_none() {
                    return Err(malformed(format!("gauge '{}' requires 'min' and 'max'", name)));
                }
            }

            let mut paths = Vec::with_capacity(refs.len());
            for raw in refs {
                let path = FieldPath::parse(raw)
                    .ok_or_else(|| malformed(format!("chart '{}' has invalid field '{}'", name, raw)))?;
                let resolved = if declared {
                    bind_declared(&schema, name, &path, descriptor.chart_type).map_err(malformed)?
                } else {
                    synthesize(&mut schema, &path, descriptor.chart_type).map_err(malformed)?;
                    path
                };
                if let (ChartType::Gauge, Some((min, max))) = (descriptor.chart_type, descriptor.range()) {
                    narrow_range(&mut schema, &resolved, min, max);
                }
                paths.push(resolved);
            }

            charts.push(ChartBinding {
                name: name.clone(),
                descriptor: descriptor.clone(),
                paths,
                scoped_fallback: !declared,
            });
        }

        Ok(Self {
            id: id.to_string(),
            definition,
            schema,
            charts,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn description(&self) -> &str {
        &self.definition.description
    }

    pub fn prompt_template(&self) -> &str {
        &self.definition.prompt_template
    }

    pub fn visualization(&self) -> &IndexMap<String, ChartDescriptor> {
        &self.definition.visualization
    }

    pub fn definition(&self) -> &TemplateDefinition {
        &self.definition
    }

    /// Effective schema used for validation and the formatting directive.
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn charts(&self) -> &[ChartBinding] {
        &self.charts
    }

    /// The effective schema adjusted to `data`. Synthesized chart fields the
    /// model placed under the chart's own object are checked there instead
    /// of at the root.
    pub fn schema_for(&self, data: &Value) -> Cow<'_, FieldSchema> {
        let moves: Vec<(&FieldPath, FieldPath)> = self
            .charts
            .iter()
            .filter(|chart| chart.scoped_fallback)
            .flat_map(|chart| chart.paths.iter().map(move |path| (path, chart.locate(data, path))))
            .filter(|(path, found)| *path != found)
            .collect();
        if moves.is_empty() {
            return Cow::Borrowed(&self.schema);
        }

        let mut schema = self.schema.clone();
        for (from, to) in moves {
            let Some(spec) = take_spec(&mut schema, from.segments()) else {
                continue;
            };
            if let Err(e) = insert_spec(&mut schema, &to, spec.clone()) {
                debug!("Keeping '{}' at the root for template '{}': {}", from, self.id, e);
                let _ = insert_spec(&mut schema, from, spec);
            }
        }
        Cow::Owned(schema)
    }

    pub fn summary(&self) -> TemplateSummary {
        TemplateSummary {
            id: self.id.clone(),
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            charts: self.charts.iter().map(|c| c.name.clone()).collect(),
        }
    }
}

/// Finds the field spec at `path`, stepping into object fields and list items.
pub fn lookup_spec<'a>(schema: &'a FieldSchema, path: &FieldPath) -> Option<&'a FieldSpec> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = schema.get(first)?;
    for segment in rest {
        current = match &current.kind {
            FieldKind::Object { fields } => fields.get(segment)?,
            FieldKind::List { items } => {
                segment.parse::<usize>().ok()?;
                items.as_deref()?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_spec_mut<'a>(schema: &'a mut FieldSchema, path: &FieldPath) -> Option<&'a mut FieldSpec> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = schema.get_mut(first)?;
    for segment in rest {
        current = match &mut current.kind {
            FieldKind::Object { fields } => fields.get_mut(segment)?,
            FieldKind::List { items } => items.as_deref_mut()?,
            _ => return None,
        };
    }
    Some(current)
}

fn check_schema(schema: &FieldSchema, parent: &str) -> std::result::Result<(), String> {
    for (name, spec) in schema {
        let here = crate::path::join(parent, name);
        if name.is_empty() || name.contains('.') {
            return Err(format!("schema field name '{}' is invalid", here));
        }
        check_spec(spec, &here)?;
    }
    Ok(())
}

fn check_spec(spec: &FieldSpec, here: &str) -> std::result::Result<(), String> {
    match &spec.kind {
        FieldKind::Number {
            min: Some(min),
            max: Some(max),
        } if min > max => Err(format!("schema field '{}' has min {} above max {}", here, min, max)),
        FieldKind::List { items: Some(items) } => check_spec(items, &format!("{}[]", here)),
        FieldKind::Object { fields } => check_schema(fields, here),
        _ => Ok(()),
    }
}

fn expected_kind(chart_type: ChartType) -> &'static str {
    match chart_type {
        ChartType::Timeline => "date",
        _ => "number",
    }
}

fn bind_declared(
    schema: &FieldSchema,
    chart: &str,
    path: &FieldPath,
    chart_type: ChartType,
) -> std::result::Result<FieldPath, String> {
    let (resolved, spec) = path
        .candidates(chart)
        .into_iter()
        .find_map(|candidate| lookup_spec(schema, &candidate).map(|spec| (candidate, spec)))
        .ok_or_else(|| format!("chart '{}' field '{}' is not declared in the schema", chart, path))?;

    let expected = expected_kind(chart_type);
    if spec.kind.name() != expected {
        return Err(format!(
            "chart '{}' field '{}' must be a {} field, found {}",
            chart,
            resolved,
            expected,
            spec.kind.name()
        ));
    }
    Ok(resolved)
}

fn synthesize(
    schema: &mut FieldSchema,
    path: &FieldPath,
    chart_type: ChartType,
) -> std::result::Result<(), String> {
    let leaf = match chart_type {
        ChartType::Timeline => FieldSpec::date(),
        _ => FieldSpec::number(),
    };
    insert_spec(schema, path, leaf)
}

/// Adds `leaf` at `path`, creating parent objects. An existing field of the
/// same kind is left as it is.
fn insert_spec(
    schema: &mut FieldSchema,
    path: &FieldPath,
    leaf: FieldSpec,
) -> std::result::Result<(), String> {
    let (last, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| "empty field path".to_string())?;

    let mut level = schema;
    for segment in parents {
        if segment.parse::<usize>().is_ok() {
            return Err(format!(
                "field '{}' indexes a list; declare a schema for list fields",
                path
            ));
        }
        let entry = level
            .entry(segment.clone())
            .or_insert_with(|| FieldSpec::object(FieldSchema::new()));
        level = match &mut entry.kind {
            FieldKind::Object { fields } => fields,
            other => {
                return Err(format!(
                    "field '{}' nests inside '{}' which is a {}",
                    path,
                    segment,
                    other.name()
                ))
            }
        };
    }

    if let Some(existing) = level.get(last) {
        if existing.kind.name() != leaf.kind.name() {
            return Err(format!(
                "field '{}' is used as both {} and {}",
                path,
                existing.kind.name(),
                leaf.kind.name()
            ));
        }
        return Ok(());
    }
    level.insert(last.clone(), leaf);
    Ok(())
}

/// Removes the field at `segments`, dropping parent objects left empty.
fn take_spec(schema: &mut FieldSchema, segments: &[String]) -> Option<FieldSpec> {
    let (first, rest) = segments.split_first()?;
    if rest.is_empty() {
        return schema.shift_remove(first);
    }
    let fields = match &mut schema.get_mut(first)?.kind {
        FieldKind::Object { fields } => fields,
        _ => return None,
    };
    let taken = take_spec(fields, rest)?;
    if fields.is_empty() {
        schema.shift_remove(first);
    }
    Some(taken)
}

fn narrow_range(schema: &mut FieldSchema, path: &FieldPath, lo: f64, hi: f64) {
    if let Some(FieldSpec {
        kind: FieldKind::Number { min, max },
        ..
    }) = lookup_spec_mut(schema, path)
    {
        *min = Some(min.map_or(lo, |m| m.max(lo)));
        *max = Some(max.map_or(hi, |m| m.min(hi)));
    }
}
