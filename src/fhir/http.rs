use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{Page, PageRequest, ResourceRef, SearchApi, SearchQuery};
use crate::config::ServerConfig;
use crate::error::{FetchError, GraphError, Result};

/// Longest error body echoed back into a fetch error
const MAX_ERROR_BODY: usize = 500;

/// FHIR REST client
///
/// Issues `GET {base}/{type}?{params}` searches and `GET {base}/{type}/{id}`
/// reads with retry on timeouts, connection failures, 429 and 5xx.
pub struct HttpSearchApi {
    client: Client,
    base_url: Url,
    max_retries: usize,
    retry_delay: Duration,
}

/// A failed attempt, before the retry decision
struct Attempt {
    cause: String,
    retryable: bool,
}

impl HttpSearchApi {
    /// Create a client for the FHIR server at `base_url`
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server root, e.g. `https://fhir.example.org/R5` (a trailing slash is ignored)
    /// * `server` - Timeouts and retry policy
    pub fn new(base_url: &str, server: &ServerConfig) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| GraphError::InvalidInput(format!("Invalid FHIR base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(GraphError::InvalidInput(format!(
                "FHIR base URL cannot carry paths: {}",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(server.timeout())
            .connect_timeout(server.connect_timeout())
            .build()
            .map_err(|e| GraphError::InvalidInput(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            max_retries: server.max_retries,
            retry_delay: server.retry_delay(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, segments: &[&str], query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    fn search_url(&self, query: &SearchQuery) -> Url {
        self.url_for(&[query.resource_type.as_str()], Some(query.params.as_str()))
    }

    /// `next` links are normally absolute; relative ones resolve against the base.
    fn continuation_url(&self, token: &str) -> std::result::Result<Url, FetchError> {
        Url::parse(token)
            .or_else(|_| self.base_url.join(token))
            .map_err(|e| FetchError::new(token, format!("Invalid next link: {}", e)))
    }

    async fn get_json(&self, url: Url, label: &str) -> std::result::Result<Value, FetchError> {
        let mut attempt = 0;
        let mut delay = self.retry_delay;

        loop {
            match self.try_get(url.clone()).await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.retryable && attempt < self.max_retries => {
                    log::warn!(
                        "Retry {}/{} for {} after error: {}",
                        attempt + 1,
                        self.max_retries,
                        label,
                        failure.cause
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2; // Exponential backoff
                    attempt += 1;
                }
                Err(failure) => return Err(FetchError::new(label, failure.cause)),
            }
        }
    }

    async fn try_get(&self, url: Url) -> std::result::Result<Value, Attempt> {
        log::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(|e| Attempt {
                retryable: e.is_timeout() || e.is_connect(),
                cause: format!("Network error: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(Attempt {
                retryable: status.as_u16() == 429 || status.is_server_error(),
                cause: format!("HTTP {}: {}", status, body),
            });
        }

        response.json::<Value>().await.map_err(|e| Attempt {
            retryable: false,
            cause: format!("Failed to parse response: {}", e),
        })
    }
}

#[async_trait]
impl SearchApi for HttpSearchApi {
    async fn search(&self, request: &PageRequest) -> std::result::Result<Page, FetchError> {
        let label = request.to_string();
        let url = match request {
            PageRequest::First(query) => self.search_url(query),
            PageRequest::Next(token) => self.continuation_url(token)?,
        };
        let bundle = self.get_json(url, &label).await?;
        Page::from_bundle(&bundle).map_err(|cause| FetchError::new(label, cause))
    }

    async fn read(&self, reference: &ResourceRef) -> std::result::Result<Value, FetchError> {
        let label = reference.to_string();
        let url = self.url_for(&[reference.resource_type.as_str(), reference.id.as_str()], None);
        let document = self.get_json(url, &label).await?;

        match ResourceRef::of(&document) {
            Some(found) if &found == reference => Ok(document),
            Some(found) => Err(FetchError::new(label, format!("server returned {}", found))),
            None => Err(FetchError::new(label, "response is not a resource")),
        }
    }
}
