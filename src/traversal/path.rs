//! Dotted path expressions (`Specimen.subject.reference`) evaluated against
//! resource documents.

use serde_json::Value;
use std::fmt;

use crate::error::{GraphError, Result};

/// A parsed path: leading type tag plus field segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    type_tag: String,
    segments: Vec<String>,
}

impl PathExpr {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let mut parts = raw.split('.');
        let type_tag = parts.next().unwrap_or_default().to_string();
        let segments: Vec<String> = parts.map(str::to_string).collect();

        if type_tag.is_empty() || segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(GraphError::Configuration(format!(
                "path '{}' must look like Type.field[.field...]",
                raw
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            type_tag,
            segments,
        })
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Resolve `path` against `document`, held under `declared_type`.
///
/// List-valued fields fan out, so two `note` entries each carrying a
/// reference yield two values. Missing fields yield nothing. Values read
/// from a `reference` field or a Reference object are reduced to bare ids
/// (`Medication/123` -> `123`); every other string is taken verbatim.
pub fn resolve(document: &Value, declared_type: &str, path: &PathExpr) -> Result<Vec<String>> {
    if path.type_tag() != declared_type {
        return Err(GraphError::Configuration(format!(
            "path '{}' cannot be resolved against a {}",
            path, declared_type
        )));
    }

    let mut branches = vec![document];
    for segment in path.segments() {
        let mut next = Vec::new();
        for value in branches {
            step(value, segment, &mut next);
        }
        if next.is_empty() {
            return Ok(Vec::new());
        }
        branches = next;
    }

    let from_reference = path.segments().last().is_some_and(|s| s == "reference");
    let mut values = Vec::new();
    for value in branches {
        collect_terminal(value, from_reference, &mut values);
    }
    Ok(values)
}

fn step<'a>(value: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => match map.get(segment) {
            Some(Value::Null) | None => {}
            Some(child) => out.push(child),
        },
        Value::Array(items) => match segment.parse::<usize>() {
            Ok(index) => out.extend(items.get(index)),
            Err(_) => {
                for item in items {
                    step(item, segment, out);
                }
            }
        },
        _ => {}
    }
}

fn collect_terminal(value: &Value, from_reference: bool, out: &mut Vec<String>) {
    match value {
        Value::String(s) if from_reference => out.extend(bare_id(s)),
        Value::String(s) if !s.trim().is_empty() => out.push(s.clone()),
        Value::String(_) => {}
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                collect_terminal(item, from_reference, out);
            }
        }
        // CodeableReference / Reference objects
        Value::Object(map) => match map.get("reference") {
            Some(Value::String(s)) => out.extend(bare_id(s)),
            _ => log::debug!("Ignoring non-scalar path result"),
        },
        Value::Null => {}
    }
}

/// Strip type prefix, base URL and version suffix from a reference.
/// Contained references (`#x`) cannot be searched and are dropped.
pub fn bare_id(reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }
    let unversioned = match reference.find("/_history/") {
        Some(at) => &reference[..at],
        None => reference,
    };
    let id = unversioned.rsplit('/').next().unwrap_or(unversioned);
    (!id.is_empty()).then(|| id.to_string())
}
