//! Dotted field paths shared by template validation, response validation and
//! chart projection.
//!
//! A path such as `evaluation.overall_score` walks nested objects; a purely
//! numeric segment (`items.0.value`) indexes into a list. Chart fields are
//! resolved from the root first and then, if the root holds an object under
//! the chart's own name, relative to that object. This lets a `metrics` chart
//! list `revenue` instead of `metrics.revenue`.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Returns `None` for empty paths or paths with empty segments (`a..b`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let segments: Vec<String> = raw.split('.').map(|s| s.trim().to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Same path rooted under `scope`.
    pub fn scoped(&self, scope: &str) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.push(scope.to_string());
        segments.extend(self.segments.iter().cloned());
        Self { segments }
    }

    /// Paths to try, in order, for a field referenced by the chart `chart_name`.
    pub fn candidates(&self, chart_name: &str) -> Vec<FieldPath> {
        let mut out = vec![self.clone()];
        if self.segments.first().map(String::as_str) != Some(chart_name) {
            out.push(self.scoped(chart_name));
        }
        out
    }

    pub fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolves against data using the chart scoping rule, returning the path
    /// that matched.
    pub fn resolve<'a>(&self, root: &'a Value, chart_name: &str) -> Option<(FieldPath, &'a Value)> {
        self.candidates(chart_name)
            .into_iter()
            .find_map(|path| path.lookup(root).map(|value| (path, value)))
    }

    /// "net_income" -> "Net Income"
    pub fn label(&self) -> String {
        self.last()
            .split(['_', '-'])
            .filter(|w| !w.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

pub(crate) fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}
