//! Canned-response search API for offline runs and tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{Page, PageRequest, ResourceRef, SearchApi};
use crate::error::FetchError;

const PAGE_MARKER: &str = "#page=";

/// In-memory [`SearchApi`] keyed by query string (`Type?params`).
///
/// Unknown queries return an empty page, like a server with no matches.
/// Every request is recorded so callers can assert on what was issued.
#[derive(Default)]
pub struct InMemorySearchApi {
    responses: Mutex<HashMap<String, Vec<Page>>>,
    resources: Mutex<HashMap<ResourceRef, Value>>,
    failures: Mutex<HashMap<String, String>>,
    issued: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl InMemorySearchApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make `document` readable by reference
    pub fn add_resource(&self, document: Value) {
        if let Some(reference) = ResourceRef::of(&document) {
            self.resources.lock().unwrap().insert(reference, document);
        }
    }

    /// Single-page answer for `query`
    pub fn add_response(&self, query: &str, primary: Vec<Value>) {
        self.add_response_with_includes(query, primary, Vec::new());
    }

    pub fn add_response_with_includes(&self, query: &str, primary: Vec<Value>, sideloaded: Vec<Value>) {
        let page = Page {
            primary,
            sideloaded,
            next_page_token: None,
        };
        self.responses.lock().unwrap().insert(query.to_string(), vec![page]);
    }

    /// Multi-page answer for `query`, chained with generated continuation tokens
    pub fn add_pages(&self, query: &str, pages: Vec<Vec<Value>>) {
        let count = pages.len();
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, primary)| Page {
                primary,
                sideloaded: Vec::new(),
                next_page_token: (i + 1 < count).then(|| format!("{}{}{}", query, PAGE_MARKER, i + 1)),
            })
            .collect();
        self.responses.lock().unwrap().insert(query.to_string(), pages);
    }

    /// Make `query` (or a `Type/id` read) fail with `cause`
    pub fn fail(&self, query: &str, cause: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(query.to_string(), cause.to_string());
    }

    /// Make only page `index` (0-based) of a multi-page `query` fail
    pub fn fail_page(&self, query: &str, index: usize, cause: &str) {
        self.fail(&format!("{}{}{}", query, PAGE_MARKER, index), cause);
    }

    /// Every search page and read requested so far, in arrival order
    pub fn issued_queries(&self) -> Vec<String> {
        self.issued.lock().unwrap().clone()
    }

    /// Issued first-page searches only (continuations excluded)
    pub fn issued_searches(&self) -> Vec<String> {
        self.issued_queries()
            .into_iter()
            .filter(|q| q.contains('?') && !q.contains(PAGE_MARKER))
            .collect()
    }

    fn check_failure(&self, key: &str) -> Result<(), FetchError> {
        match self.failures.lock().unwrap().get(key) {
            Some(cause) => Err(FetchError::new(key, cause.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SearchApi for InMemorySearchApi {
    async fn search(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let label = request.to_string();
        self.issued.lock().unwrap().push(label.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let (key, index) = match request {
            PageRequest::First(query) => (query.to_string(), 0),
            PageRequest::Next(token) => {
                let (key, index) = token
                    .rsplit_once(PAGE_MARKER)
                    .and_then(|(key, n)| n.parse::<usize>().ok().map(|n| (key.to_string(), n)))
                    .ok_or_else(|| FetchError::new(token.clone(), "unknown continuation token"))?;
                (key, index)
            }
        };
        self.check_failure(&label)?;
        self.check_failure(&key)?;

        let responses = self.responses.lock().unwrap();
        match responses.get(&key) {
            Some(pages) => pages
                .get(index)
                .cloned()
                .ok_or_else(|| FetchError::new(label, "continuation past last page")),
            None => Ok(Page::default()),
        }
    }

    async fn read(&self, reference: &ResourceRef) -> Result<Value, FetchError> {
        let key = reference.to_string();
        self.issued.lock().unwrap().push(key.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure(&key)?;

        self.resources
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| FetchError::new(key, "HTTP 404 Not Found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::SearchQuery;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_query_is_empty_page() {
        let api = InMemorySearchApi::new();
        let page = api
            .search(&PageRequest::First(SearchQuery::new("Condition", "subject=1")))
            .await
            .unwrap();
        assert!(page.primary.is_empty());
        assert!(page.next_page_token.is_none());
        assert_eq!(api.issued_searches(), vec!["Condition?subject=1".to_string()]);
    }

    #[tokio::test]
    async fn test_read_known_and_missing() {
        let api = InMemorySearchApi::new();
        api.add_resource(json!({"resourceType": "Patient", "id": "42"}));

        let doc = api.read(&ResourceRef::new("Patient", "42")).await.unwrap();
        assert_eq!(doc["id"], "42");

        let err = api.read(&ResourceRef::new("Patient", "999")).await.unwrap_err();
        assert!(err.cause.contains("404"));
    }

    #[tokio::test]
    async fn test_continuation_tokens_chain_pages() {
        let api = InMemorySearchApi::new();
        api.add_pages("Patient?_count=1", vec![vec![json!({"resourceType": "Patient", "id": "1"})], vec![]]);

        let first = api
            .search(&PageRequest::First(SearchQuery::new("Patient", "_count=1")))
            .await
            .unwrap();
        let token = first.next_page_token.unwrap();
        let second = api.search(&PageRequest::Next(token)).await.unwrap();
        assert!(second.primary.is_empty());
        assert!(second.next_page_token.is_none());
        assert_eq!(api.issued_searches(), vec!["Patient?_count=1".to_string()]);
        assert_eq!(api.issued_queries().len(), 2);
    }
}
