use crate::path::FieldPath;
use crate::template::{ChartBinding, ChartType, Template};
use crate::validator::{json_type, AnalysisResult, DATE_FORMAT};
use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PointValue {
    Number(f64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    /// Full path of the source field in the analysis data.
    pub field: String,
    pub label: String,
    pub value: PointValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChartRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderableChart {
    pub name: String,
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<ChartRange>,
    pub points: Vec<DataPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    MissingField { field: String },
    NullField { field: String },
    WrongType { field: String, expected: String, found: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingField { field } => write!(f, "field '{}' is missing", field),
            SkipReason::NullField { field } => write!(f, "field '{}' is null", field),
            SkipReason::WrongType {
                field,
                expected,
                found,
            } => write!(f, "field '{}' is {} but the chart needs {}", field, found, expected),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedChart {
    pub name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Projection {
    /// Renderable charts in the template's declared order.
    pub charts: Vec<RenderableChart>,
    pub skipped: Vec<SkippedChart>,
}

/// Projects the result into the template's charts. A chart whose fields
/// cannot all be resolved is skipped on its own; the rest still render.
pub fn project(result: &AnalysisResult, template: &Template) -> Projection {
    project_charts(result, template.charts())
}

pub fn project_charts(result: &AnalysisResult, bindings: &[ChartBinding]) -> Projection {
    let mut projection = Projection::default();

    for binding in bindings {
        match build_chart(&result.data, binding) {
            Ok(chart) => projection.charts.push(chart),
            Err(reason) => {
                warn!("Skipping chart '{}': {}", binding.name, reason);
                projection.skipped.push(SkippedChart {
                    name: binding.name.clone(),
                    reason,
                });
            }
        }
    }

    debug!(
        "Projected {} chart(s), skipped {}",
        projection.charts.len(),
        projection.skipped.len()
    );
    projection
}

fn build_chart(data: &Value, binding: &ChartBinding) -> Result<RenderableChart, SkipReason> {
    let descriptor = &binding.descriptor;
    let range = descriptor.range().map(|(min, max)| ChartRange { min, max });

    let mut points = Vec::with_capacity(binding.paths.len());
    for path in &binding.paths {
        let path = &binding.locate(data, path);
        let value = match descriptor.chart_type {
            ChartType::Timeline => PointValue::Date(date_at(data, path)?),
            ChartType::Gauge => {
                let number = number_at(data, path)?;
                PointValue::Number(match range {
                    Some(r) => number.clamp(r.min, r.max),
                    None => number,
                })
            }
            ChartType::Bar | ChartType::Radar => PointValue::Number(number_at(data, path)?),
        };
        points.push(DataPoint {
            field: path.to_string(),
            label: path.label(),
            value,
        });
    }

    if descriptor.chart_type == ChartType::Timeline {
        points.sort_by(|a, b| match (&a.value, &b.value) {
            (PointValue::Date(x), PointValue::Date(y)) => x.cmp(y),
            _ => std::cmp::Ordering::Equal,
        });
    }

    Ok(RenderableChart {
        name: binding.name.clone(),
        chart_type: descriptor.chart_type,
        title: descriptor.title.clone(),
        unit: descriptor.unit.clone(),
        range: if descriptor.chart_type == ChartType::Gauge {
            range
        } else {
            None
        },
        points,
    })
}

fn value_at<'a>(data: &'a Value, path: &FieldPath) -> Result<&'a Value, SkipReason> {
    match path.lookup(data) {
        None => Err(SkipReason::MissingField {
            field: path.to_string(),
        }),
        Some(Value::Null) => Err(SkipReason::NullField {
            field: path.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn number_at(data: &Value, path: &FieldPath) -> Result<f64, SkipReason> {
    let value = value_at(data, path)?;
    value.as_f64().ok_or_else(|| SkipReason::WrongType {
        field: path.to_string(),
        expected: "number".to_string(),
        found: json_type(value).to_string(),
    })
}

fn date_at(data: &Value, path: &FieldPath) -> Result<NaiveDate, SkipReason> {
    let value = value_at(data, path)?;
    value
        .as_str()
        .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
        .ok_or_else(|| SkipReason::WrongType {
            field: path.to_string(),
            expected: "date".to_string(),
            found: json_type(value).to_string(),
        })
}
