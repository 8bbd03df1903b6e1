pub mod config;
pub mod definition;
pub mod error;
pub mod fhir;
pub mod store;
pub mod traversal;

pub use config::Config;
pub use definition::{CompiledGraph, GraphDefinition, Link};
pub use error::{FetchError, GraphError, Result};
pub use fhir::{FetchGateway, HttpSearchApi, InMemorySearchApi, ResourceRef, SearchApi, SearchQuery};
pub use store::ResourceDb;
pub use traversal::{
    summarize, CancelMode, ResultSet, StartPoint, TraversalEngine, TraversalOptions, TraversalOutcome,
    TraversalReport,
};
