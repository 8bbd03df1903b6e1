//! FHIR search boundary: resource identity, search requests, result pages
//! and the `SearchApi` trait the traversal engine talks to.

pub mod gateway;
pub mod http;
pub mod memory;

pub use gateway::{FetchGateway, FetchOutcome, PartialFetch};
pub use http::HttpSearchApi;
pub use memory::InMemorySearchApi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{FetchError, GraphError, Result};

/// `(type, id)` identity of a resource; the deduplication key of a traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Identity of a resource document, if it carries `resourceType` and `id`.
    pub fn of(document: &Value) -> Option<Self> {
        let resource_type = document.get("resourceType")?.as_str()?;
        let id = document.get("id")?.as_str()?;
        if resource_type.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(resource_type, id))
    }

    /// Parse a relative reference such as `Patient/42`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim_matches('/').split_once('/') {
            Some((resource_type, id)) if !resource_type.is_empty() && !id.is_empty() && !id.contains('/') => {
                Ok(Self::new(resource_type, id))
            }
            _ => Err(GraphError::InvalidInput(format!(
                "expected a reference of the form Type/id, got '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A concrete search against one resource type, e.g. `Specimen?subject=7&_count=1000`.
///
/// `params` is kept verbatim; directives such as `_include` are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SearchQuery {
    pub resource_type: String,
    pub params: String,
}

impl SearchQuery {
    pub fn new(resource_type: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            params: params.into(),
        }
    }

    /// Parse `Type?params` or `/Type?params` (the params part may be absent).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('/');
        let (resource_type, params) = s.split_once('?').unwrap_or((s, ""));
        if resource_type.is_empty() || resource_type.contains('/') {
            return Err(GraphError::InvalidInput(format!(
                "expected a search of the form Type?params, got '{}'",
                s
            )));
        }
        Ok(Self::new(resource_type, params))
    }

    pub fn directives(&self) -> QueryDirectives {
        QueryDirectives::parse(&self.params)
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.resource_type)
        } else {
            write!(f, "{}?{}", self.resource_type, self.params)
        }
    }
}

/// Paging and side-loading directives carried by a query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryDirectives {
    pub count: Option<u32>,
    pub total_accurate: bool,
    pub includes: Vec<String>,
    pub revincludes: Vec<String>,
}

impl QueryDirectives {
    pub fn parse(params: &str) -> Self {
        let mut directives = Self::default();
        for pair in params.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "_count" => directives.count = value.parse().ok(),
                "_total" => directives.total_accurate = value == "accurate",
                "_include" => directives.includes.push(value.to_string()),
                "_revinclude" => directives.revincludes.push(value.to_string()),
                _ => {}
            }
        }
        directives
    }

    pub fn side_loads(&self) -> bool {
        !self.includes.is_empty() || !self.revincludes.is_empty()
    }
}

/// Request for one page of a search: the first page of a query, or a
/// continuation token handed back by the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    First(SearchQuery),
    Next(String),
}

impl fmt::Display for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageRequest::First(query) => write!(f, "{}", query),
            PageRequest::Next(token) => write!(f, "{}", token),
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Resources matching the query itself
    pub primary: Vec<Value>,
    /// Resources pulled in by `_include` / `_revinclude`
    pub sideloaded: Vec<Value>,
    pub next_page_token: Option<String>,
}

impl Page {
    /// Split a FHIR searchset Bundle into primary and side-loaded resources.
    ///
    /// Entries with `search.mode == "include"` are side-loaded, `outcome`
    /// entries are dropped, everything else is a primary match. The `next`
    /// link becomes the continuation token.
    pub fn from_bundle(bundle: &Value) -> std::result::Result<Self, String> {
        match bundle.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {}
            Some(other) => return Err(format!("expected a Bundle, got {}", other)),
            None => return Err("response has no resourceType".to_string()),
        }

        let mut page = Page::default();
        if let Some(entries) = bundle.get("entry").and_then(Value::as_array) {
            for entry in entries {
                let Some(resource) = entry.get("resource") else {
                    continue;
                };
                let mode = entry
                    .get("search")
                    .and_then(|s| s.get("mode"))
                    .and_then(Value::as_str);
                match mode {
                    Some("include") => page.sideloaded.push(resource.clone()),
                    Some("outcome") => {
                        log::debug!("Skipping OperationOutcome entry in search bundle");
                    }
                    _ => page.primary.push(resource.clone()),
                }
            }
        }

        page.next_page_token = bundle
            .get("link")
            .and_then(Value::as_array)
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.get("relation").and_then(Value::as_str) == Some("next"))
            })
            .and_then(|l| l.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(page)
    }
}

/// Remote FHIR search API. Implementations must be cheap to share across tasks.
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Fetch one page of a search.
    async fn search(&self, request: &PageRequest) -> std::result::Result<Page, FetchError>;

    /// Read a single resource by reference.
    async fn read(&self, reference: &ResourceRef) -> std::result::Result<Value, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_ref_of_document() {
        let doc = json!({"resourceType": "Specimen", "id": "7"});
        assert_eq!(ResourceRef::of(&doc), Some(ResourceRef::new("Specimen", "7")));
        assert_eq!(ResourceRef::of(&json!({"resourceType": "Specimen"})), None);
        assert_eq!(ResourceRef::of(&json!({"resourceType": "", "id": "1"})), None);
    }

    #[test]
    fn test_resource_ref_parse_and_display() {
        let r = ResourceRef::parse("Patient/42").unwrap();
        assert_eq!(r, ResourceRef::new("Patient", "42"));
        assert_eq!(r.to_string(), "Patient/42");
        assert!(ResourceRef::parse("Patient").is_err());
        assert!(ResourceRef::parse("Patient/42/_history/1").is_err());
    }

    #[test]
    fn test_search_query_parse() {
        let q = SearchQuery::parse("/ResearchStudy?identifier=TCGA-BRCA").unwrap();
        assert_eq!(q.resource_type, "ResearchStudy");
        assert_eq!(q.params, "identifier=TCGA-BRCA");
        assert_eq!(q.to_string(), "ResearchStudy?identifier=TCGA-BRCA");

        let bare = SearchQuery::parse("Patient").unwrap();
        assert_eq!(bare.params, "");
        assert_eq!(bare.to_string(), "Patient");

        assert!(SearchQuery::parse("?x=1").is_err());
    }

    #[test]
    fn test_directives_parsed_from_params() {
        let q = SearchQuery::new(
            "Patient",
            "_has:ResearchSubject:subject:study={path}&_revinclude=Group:member&_count=1000&_total=accurate",
        );
        let d = q.directives();
        assert_eq!(d.count, Some(1000));
        assert!(d.total_accurate);
        assert_eq!(d.revincludes, vec!["Group:member".to_string()]);
        assert!(d.includes.is_empty());
        assert!(d.side_loads());
    }

    #[test]
    fn test_page_from_bundle_splits_includes() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": [
                {"relation": "self", "url": "http://x/Patient?page=1"},
                {"relation": "next", "url": "http://x/Patient?page=2"}
            ],
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "1"}, "search": {"mode": "match"}},
                {"resource": {"resourceType": "Group", "id": "g"}, "search": {"mode": "include"}},
                {"resource": {"resourceType": "OperationOutcome"}, "search": {"mode": "outcome"}},
                {"resource": {"resourceType": "Patient", "id": "2"}}
            ]
        });
        let page = Page::from_bundle(&bundle).unwrap();
        assert_eq!(page.primary.len(), 2);
        assert_eq!(page.sideloaded.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("http://x/Patient?page=2"));
    }

    #[test]
    fn test_page_from_bundle_rejects_non_bundle() {
        let err = Page::from_bundle(&json!({"resourceType": "OperationOutcome"})).unwrap_err();
        assert!(err.contains("OperationOutcome"));
    }
}
