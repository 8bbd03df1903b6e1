//! Deduplicated result set and the per-run report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::definition::CompiledGraph;
use crate::error::FetchError;
use crate::fhir::{FetchOutcome, ResourceRef, SearchQuery};

/// Arena of resource documents indexed by `(type, id)`.
///
/// First insert of a ref wins; later documents with the same ref are dropped.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    documents: Vec<Value>,
    refs: Vec<ResourceRef>,
    index: HashMap<ResourceRef, usize>,
}

/// What happened to a document offered to the result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert {
    New(ResourceRef),
    Duplicate(ResourceRef),
    /// No `resourceType` or `id`
    Invalid,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, document: Value) -> Insert {
        let Some(reference) = ResourceRef::of(&document) else {
            return Insert::Invalid;
        };
        if self.index.contains_key(&reference) {
            return Insert::Duplicate(reference);
        }
        self.index.insert(reference.clone(), self.documents.len());
        self.refs.push(reference.clone());
        self.documents.push(document);
        Insert::New(reference)
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<&Value> {
        self.index.get(reference).map(|&i| &self.documents[i])
    }

    pub fn contains(&self, reference: &ResourceRef) -> bool {
        self.index.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Documents in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceRef, &Value)> {
        self.refs.iter().zip(self.documents.iter())
    }

    pub fn of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.iter()
            .filter(move |(r, _)| r.resource_type == resource_type)
            .map(|(_, doc)| doc)
    }

    /// All refs in canonical order, for order-independent comparison
    pub fn sorted_refs(&self) -> Vec<ResourceRef> {
        let mut refs = self.refs.clone();
        refs.sort();
        refs
    }

    pub fn count_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for reference in &self.refs {
            *counts.entry(reference.resource_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Per-link counters; part of the public report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub link_index: usize,
    pub source_type: String,
    pub target_type: String,
    pub queries_issued: usize,
    /// Identical to a query this link already dispatched in this run
    pub queries_skipped: usize,
    pub queries_abandoned: usize,
    pub queries_truncated: usize,
    pub pages_fetched: usize,
    pub resources_returned: usize,
    pub sideloaded_returned: usize,
    pub new_resources: usize,
    pub reached_again: usize,
    /// Source resources whose path resolved to nothing
    pub empty_resolutions: usize,
    pub pass_through: usize,
    pub errors: usize,
}

/// A failed query, keyed by link and the resources that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchErrorRecord {
    /// `None` for the start resource / start query
    pub link_index: Option<usize>,
    pub query: String,
    pub cause: String,
    pub sources: Vec<ResourceRef>,
}

impl FetchErrorRecord {
    pub fn new(link_index: Option<usize>, error: FetchError, sources: Vec<ResourceRef>) -> Self {
        Self {
            link_index,
            query: error.query,
            cause: error.cause,
            sources,
        }
    }
}

/// Non-fatal conditions that shaped the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraversalWarning {
    /// Frontier still had nodes when the depth ceiling was reached
    DepthExceeded { max_depth: usize, pending: usize },
    PageLimitReached { link_index: usize, query: String, pages: usize },
    Cancelled { depth: usize },
    InvalidResource { link_index: Option<usize>, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    #[default]
    Complete,
    DepthLimited,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraversalReport {
    pub run_id: Uuid,
    pub graph_id: String,
    pub start: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub depth_reached: usize,
    pub completion: Completion,
    /// Cancelled before reaching a fixed point; the result set is what had accumulated
    pub partial: bool,
    pub resource_counts: BTreeMap<String, usize>,
    pub link_stats: Vec<LinkStats>,
    pub errors: Vec<FetchErrorRecord>,
    pub warnings: Vec<TraversalWarning>,
}

impl TraversalReport {
    pub fn total_queries(&self) -> usize {
        self.link_stats.iter().map(|s| s.queries_issued).sum()
    }
}

/// Owns the result set during a run and keeps the books
#[derive(Debug, Default)]
pub struct ResultAggregator {
    result_set: ResultSet,
    link_stats: Vec<LinkStats>,
    errors: Vec<FetchErrorRecord>,
    warnings: Vec<TraversalWarning>,
    run_id: Uuid,
    graph_id: String,
    start: String,
    started_at: DateTime<Utc>,
}

impl ResultAggregator {
    pub fn new(graph: &CompiledGraph, start: String) -> Self {
        let link_stats = graph
            .links
            .iter()
            .map(|link| LinkStats {
                link_index: link.index,
                source_type: link.source_type.clone(),
                target_type: link.target_type.clone(),
                ..LinkStats::default()
            })
            .collect();

        Self {
            result_set: ResultSet::new(),
            link_stats,
            errors: Vec::new(),
            warnings: Vec::new(),
            run_id: Uuid::new_v4(),
            graph_id: graph.id.clone(),
            start,
            started_at: Utc::now(),
        }
    }

    pub fn result_set(&self) -> &ResultSet {
        &self.result_set
    }

    pub fn stats_mut(&mut self, link_index: usize) -> Option<&mut LinkStats> {
        self.link_stats.get_mut(link_index)
    }

    /// Insert `resources` reached through `link` (`None` for the start);
    /// returns refs seen for the first time.
    pub fn record(&mut self, link: Option<usize>, resources: Vec<Value>) -> Vec<ResourceRef> {
        let mut new_refs = Vec::new();
        let mut reached_again = 0;
        let mut invalid = 0;
        for document in resources {
            match self.result_set.insert(document) {
                Insert::New(reference) => new_refs.push(reference),
                Insert::Duplicate(_) => reached_again += 1,
                Insert::Invalid => invalid += 1,
            }
        }

        if invalid > 0 {
            log::warn!("Ignored {} resource(s) without resourceType/id", invalid);
            self.warnings.push(TraversalWarning::InvalidResource {
                link_index: link,
                count: invalid,
            });
        }
        if let Some(stats) = link.and_then(|i| self.link_stats.get_mut(i)) {
            stats.new_resources += new_refs.len();
            stats.reached_again += reached_again;
        }
        new_refs
    }

    /// Book a completed query and insert everything it returned
    pub fn record_fetch(&mut self, link_index: usize, query: &SearchQuery, outcome: FetchOutcome) -> Vec<ResourceRef> {
        if let Some(stats) = self.link_stats.get_mut(link_index) {
            stats.pages_fetched += outcome.pages;
            stats.resources_returned += outcome.primary.len();
            stats.sideloaded_returned += outcome.sideloaded.len();
            if outcome.truncated {
                stats.queries_truncated += 1;
            }
        }
        if outcome.truncated {
            self.warnings.push(TraversalWarning::PageLimitReached {
                link_index,
                query: query.to_string(),
                pages: outcome.pages,
            });
        }

        let mut resources = outcome.primary;
        resources.extend(outcome.sideloaded);
        self.record(Some(link_index), resources)
    }

    pub fn record_error(&mut self, record: FetchErrorRecord) {
        if let Some(stats) = record.link_index.and_then(|i| self.link_stats.get_mut(i)) {
            stats.errors += 1;
        }
        self.errors.push(record);
    }

    pub fn warn(&mut self, warning: TraversalWarning) {
        self.warnings.push(warning);
    }

    pub fn finalize(self, completion: Completion, depth_reached: usize) -> (ResultSet, TraversalReport) {
        let report = TraversalReport {
            run_id: self.run_id,
            graph_id: self.graph_id,
            start: self.start,
            started_at: self.started_at,
            finished_at: Utc::now(),
            depth_reached,
            completion,
            partial: completion == Completion::Cancelled,
            resource_counts: self.result_set.count_by_type(),
            link_stats: self.link_stats,
            errors: self.errors,
            warnings: self.warnings,
        };
        (self.result_set, report)
    }
}

/// Count and outgoing references of one resource type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    pub count: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, usize>,
}

/// `resourceType(count) -count-> resourceType` view of a result set
pub fn summarize(result_set: &ResultSet) -> BTreeMap<String, TypeSummary> {
    let mut summary: BTreeMap<String, TypeSummary> = BTreeMap::new();
    for (reference, document) in result_set.iter() {
        let entry = summary.entry(reference.resource_type.clone()).or_default();
        entry.count += 1;

        let mut found = Vec::new();
        collect_references(document, &mut found);
        for target in found.iter().filter_map(|r| referenced_type(r)) {
            *entry.references.entry(target.to_string()).or_insert(0) += 1;
        }
    }
    summary
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    ("reference", Value::String(s)) => out.push(s),
                    _ => collect_references(child, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

/// `Patient/1` and `https://x/fhir/Patient/1` both reference a Patient
fn referenced_type(reference: &str) -> Option<&str> {
    if reference.starts_with('#') {
        return None;
    }
    let unversioned = match reference.find("/_history/") {
        Some(at) => &reference[..at],
        None => reference,
    };
    let mut parts = unversioned.rsplit('/');
    let _id = parts.next()?;
    parts.next().filter(|t| !t.is_empty())
}
