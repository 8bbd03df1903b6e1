//! Params templates and the queries built from them.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::error::{GraphError, Result};
use crate::fhir::SearchQuery;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("Invalid regex pattern"))
}

/// A link's `params` string with at most one `{token}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamsTemplate {
    raw: String,
    token: Option<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    name: String,
    start: usize,
    end: usize,
}

impl ParamsTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let tokens: Vec<Token> = token_pattern()
            .captures_iter(raw)
            .filter_map(|cap| {
                let whole = cap.get(0)?;
                Some(Token {
                    name: cap.get(1)?.as_str().trim().to_string(),
                    start: whole.start(),
                    end: whole.end(),
                })
            })
            .collect();

        let opens = raw.matches('{').count();
        let closes = raw.matches('}').count();
        if opens != tokens.len() || closes != tokens.len() {
            return Err(GraphError::Configuration(format!(
                "params '{}' has unbalanced braces",
                raw
            )));
        }
        if tokens.len() > 1 {
            return Err(GraphError::Configuration(format!(
                "params '{}' has {} substitution tokens, expected at most one",
                raw,
                tokens.len()
            )));
        }
        if tokens.iter().any(|t| t.name.is_empty()) {
            return Err(GraphError::Configuration(format!(
                "params '{}' has an empty substitution token",
                raw
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            token: tokens.into_iter().next(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Name inside the braces (`path` for `{path}`), if the template has one
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.name.as_str())
    }

    /// An id-list filter: values are joined into one query by default
    pub fn is_id_filter(&self) -> bool {
        self.raw.split('&').any(|pair| pair.starts_with("_id="))
    }

    /// Replace the token with `value`; static templates come back unchanged.
    pub fn substitute(&self, value: &str) -> String {
        match &self.token {
            Some(token) => format!("{}{}{}", &self.raw[..token.start], value, &self.raw[token.end..]),
            None => self.raw.clone(),
        }
    }
}

/// Whether resolved values become one query each or share a batched query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Expand,
    Batch,
}

impl QueryMode {
    /// Link override wins; otherwise `_id=` templates batch and everything else expands.
    pub fn for_template(template: &ParamsTemplate, batch: Option<bool>) -> Self {
        match batch {
            Some(true) => QueryMode::Batch,
            Some(false) => QueryMode::Expand,
            None if template.is_id_filter() => QueryMode::Batch,
            None => QueryMode::Expand,
        }
    }
}

/// Run-wide knobs for query construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Drop repeated resolved values before building (first occurrence kept)
    pub dedupe_values: bool,
    /// Max ids per batched query
    pub batch_chunk_size: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            dedupe_values: true,
            batch_chunk_size: 50,
        }
    }
}

/// A query plus the resolved values it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub query: SearchQuery,
    pub values: Vec<String>,
}

/// Build the concrete queries for one link.
///
/// No values means no queries.
pub fn build(
    target_type: &str,
    template: &ParamsTemplate,
    values: &[String],
    mode: QueryMode,
    policy: &QueryPolicy,
) -> Vec<BuiltQuery> {
    let mut values: Vec<String> = values.to_vec();
    if policy.dedupe_values {
        let mut seen = std::collections::HashSet::new();
        values.retain(|v| seen.insert(v.clone()));
    }
    if values.is_empty() {
        return Vec::new();
    }

    match mode {
        QueryMode::Expand => values
            .into_iter()
            .map(|value| BuiltQuery {
                query: SearchQuery::new(target_type, template.substitute(&value)),
                values: vec![value],
            })
            .collect(),
        QueryMode::Batch => values
            .chunks(policy.batch_chunk_size.max(1))
            .map(|chunk| BuiltQuery {
                query: SearchQuery::new(target_type, template.substitute(&chunk.join(","))),
                values: chunk.to_vec(),
            })
            .collect(),
    }
}
