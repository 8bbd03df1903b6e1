//! The traversal executor: path resolution, query building, the frontier
//! engine and result aggregation.

pub mod aggregate;
pub mod engine;
pub mod path;
pub mod query;

pub use aggregate::{
    summarize, Completion, FetchErrorRecord, LinkStats, ResultAggregator, ResultSet, TraversalReport,
    TraversalWarning, TypeSummary,
};
pub use engine::{CancelMode, StartPoint, TraversalEngine, TraversalOptions, TraversalOutcome, TraversalState};
pub use query::{QueryMode, QueryPolicy};
