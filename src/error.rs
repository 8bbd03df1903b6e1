use thiserror::Error;

/// Main error type for fhirgraph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Broken graph definition (bad template, type tag mismatch, missing token).
    /// Always raised before any fetch is issued.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single search or read against the FHIR server failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Result store errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failure of one query (all of its pages) or one read.
///
/// Recoverable: the engine records it against the link and source
/// resources that produced the query and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Fetch failed for {query}: {cause}")]
pub struct FetchError {
    pub query: String,
    pub cause: String,
}

impl FetchError {
    pub fn new(query: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            cause: cause.into(),
        }
    }
}

/// Convenient Result type using GraphError
pub type Result<T> = std::result::Result<T, GraphError>;
