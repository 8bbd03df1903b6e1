//! Executes one search to completion, following pagination.

use serde_json::Value;
use std::sync::Arc;

use super::{PageRequest, ResourceRef, SearchApi, SearchQuery};
use crate::error::FetchError;

/// Everything one query returned across all of its pages
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub primary: Vec<Value>,
    pub sideloaded: Vec<Value>,
    pub pages: usize,
    /// A `next` page was still available when the page cap was hit
    pub truncated: bool,
}

/// A query that failed part-way; `outcome` holds the pages received before the failure
#[derive(Debug, Clone)]
pub struct PartialFetch {
    pub error: FetchError,
    pub outcome: FetchOutcome,
}

/// Page-following wrapper around a [`SearchApi`]
#[derive(Clone)]
pub struct FetchGateway {
    api: Arc<dyn SearchApi>,
    max_pages: usize,
}

impl FetchGateway {
    /// `max_pages` caps how many pages a single query may pull (at least one).
    pub fn new(api: Arc<dyn SearchApi>, max_pages: usize) -> Self {
        Self {
            api,
            max_pages: max_pages.max(1),
        }
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Run `query`, following `next` tokens page after page.
    ///
    /// A failing page ends the query. Pages already received are handed back
    /// with the error, which is keyed by the original query string rather
    /// than the continuation token.
    pub async fn execute(&self, query: &SearchQuery) -> Result<FetchOutcome, PartialFetch> {
        let mut outcome = FetchOutcome::default();
        let mut request = PageRequest::First(query.clone());

        loop {
            let page = match self.api.search(&request).await {
                Ok(page) => page,
                Err(e) => {
                    let cause = if outcome.pages == 0 {
                        e.cause
                    } else {
                        format!("page {}: {}", outcome.pages + 1, e.cause)
                    };
                    return Err(PartialFetch {
                        error: FetchError::new(query.to_string(), cause),
                        outcome,
                    });
                }
            };

            outcome.pages += 1;
            outcome.primary.extend(page.primary);
            outcome.sideloaded.extend(page.sideloaded);

            match page.next_page_token {
                None => break,
                Some(_) if outcome.pages >= self.max_pages => {
                    log::warn!(
                        "Page limit ({}) reached for {}, remaining pages skipped",
                        self.max_pages,
                        query
                    );
                    outcome.truncated = true;
                    break;
                }
                Some(token) => request = PageRequest::Next(token),
            }
        }

        log::debug!(
            "{} -> {} primary, {} side-loaded over {} page(s)",
            query,
            outcome.primary.len(),
            outcome.sideloaded.len(),
            outcome.pages
        );
        if !outcome.sideloaded.is_empty() && !query.directives().side_loads() {
            log::debug!("{} returned side-loaded entries without _include/_revinclude", query);
        }
        Ok(outcome)
    }

    pub async fn read(&self, reference: &ResourceRef) -> Result<Value, FetchError> {
        self.api.read(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::InMemorySearchApi;
    use serde_json::json;

    fn patient(id: &str) -> Value {
        json!({"resourceType": "Patient", "id": id})
    }

    #[tokio::test]
    async fn test_execute_follows_all_pages() {
        let api = Arc::new(InMemorySearchApi::new());
        api.add_pages(
            "Patient?_count=2",
            vec![vec![patient("1"), patient("2")], vec![patient("3"), patient("4")], vec![patient("5")]],
        );
        let gateway = FetchGateway::new(api.clone(), 10);

        let outcome = gateway.execute(&SearchQuery::new("Patient", "_count=2")).await.unwrap();
        assert_eq!(outcome.primary.len(), 5);
        assert_eq!(outcome.pages, 3);
        assert!(!outcome.truncated);
        assert_eq!(api.issued_queries().len(), 3);
    }

    #[tokio::test]
    async fn test_execute_stops_at_page_cap() {
        let api = Arc::new(InMemorySearchApi::new());
        api.add_pages(
            "Patient?_count=1",
            vec![vec![patient("1")], vec![patient("2")], vec![patient("3")]],
        );
        let gateway = FetchGateway::new(api.clone(), 2);

        let outcome = gateway.execute(&SearchQuery::new("Patient", "_count=1")).await.unwrap();
        assert_eq!(outcome.primary.len(), 2);
        assert_eq!(outcome.pages, 2);
        assert!(outcome.truncated);
    }

    #[tokio::test]
    async fn test_execute_keeps_sideloaded_apart() {
        let api = Arc::new(InMemorySearchApi::new());
        api.add_response_with_includes(
            "Patient?_revinclude=Group:member",
            vec![patient("1")],
            vec![json!({"resourceType": "Group", "id": "g1"})],
        );
        let gateway = FetchGateway::new(api, 5);

        let outcome = gateway
            .execute(&SearchQuery::new("Patient", "_revinclude=Group:member"))
            .await
            .unwrap();
        assert_eq!(outcome.primary.len(), 1);
        assert_eq!(outcome.sideloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_error_names_original_query() {
        let api = Arc::new(InMemorySearchApi::new());
        api.fail("Specimen?subject=1", "HTTP 503");
        let gateway = FetchGateway::new(api, 5);

        let failed = gateway
            .execute(&SearchQuery::new("Specimen", "subject=1"))
            .await
            .unwrap_err();
        assert_eq!(failed.error.query, "Specimen?subject=1");
        assert_eq!(failed.error.cause, "HTTP 503");
        assert_eq!(failed.outcome.pages, 0);
    }

    #[tokio::test]
    async fn test_later_page_failure_keeps_earlier_pages() {
        let api = Arc::new(InMemorySearchApi::new());
        api.add_pages(
            "Patient?_count=2",
            vec![vec![patient("1"), patient("2")], vec![patient("3")], vec![patient("4")]],
        );
        api.fail_page("Patient?_count=2", 1, "HTTP 502");
        let gateway = FetchGateway::new(api, 10);

        let failed = gateway
            .execute(&SearchQuery::new("Patient", "_count=2"))
            .await
            .unwrap_err();
        assert_eq!(failed.error.query, "Patient?_count=2");
        assert_eq!(failed.error.cause, "page 2: HTTP 502");
        assert_eq!(failed.outcome.pages, 1);
        assert_eq!(failed.outcome.primary.len(), 2);
    }

    #[test]
    fn test_zero_page_cap_is_raised_to_one() {
        let gateway = FetchGateway::new(Arc::new(InMemorySearchApi::new()), 0);
        assert_eq!(gateway.max_pages(), 1);
    }
}
