//! Frontier-driven traversal over a compiled graph definition.
//!
//! Each depth expands every frontier node along the links leaving its role
//! type, fetches all resulting queries concurrently, and builds the next
//! frontier from resources not seen before. Pass-through links re-tag a node
//! with a new role instead of fetching. The run ends when the frontier is
//! empty, the depth ceiling is hit, or the caller cancels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use super::aggregate::{Completion, FetchErrorRecord, ResultAggregator, ResultSet, TraversalReport, TraversalWarning};
use super::path::resolve;
use super::query::{build, QueryPolicy};
use crate::definition::{CompiledGraph, GraphDefinition, LinkKind};
use crate::error::{FetchError, Result};
use crate::fhir::{FetchGateway, ResourceRef, SearchApi, SearchQuery};

/// Engine state, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    /// Frontier holds unexpanded nodes
    Pending,
    /// Links are being evaluated for the frontier
    Expanding,
    /// Waiting on this depth's fetches
    Draining,
    Done,
}

/// What happens to in-flight fetches on cancellation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelMode {
    /// Let running fetches finish, start no new ones
    #[default]
    Drain,
    /// Abort running fetches
    Abandon,
}

#[derive(Debug, Clone)]
pub struct TraversalOptions {
    /// Maximum number of expansion rounds
    pub max_depth: usize,
    /// Page cap per query
    pub max_pages: usize,
    /// Concurrent fetches per depth
    pub max_concurrency: usize,
    pub cancellation: CancellationToken,
    pub cancel_mode: CancelMode,
    pub query_policy: QueryPolicy,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_pages: 100,
            max_concurrency: 10,
            cancellation: CancellationToken::new(),
            cancel_mode: CancelMode::default(),
            query_policy: QueryPolicy::default(),
        }
    }
}

/// Where a run begins
#[derive(Debug, Clone)]
pub enum StartPoint {
    /// Read this resource first
    Reference(ResourceRef),
    /// Every resource matched by this search is a start node
    Query(SearchQuery),
    /// Caller already holds the start document
    Document(Value),
}

impl fmt::Display for StartPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPoint::Reference(reference) => write!(f, "{}", reference),
            StartPoint::Query(query) => write!(f, "{}", query),
            StartPoint::Document(document) => match ResourceRef::of(document) {
                Some(reference) => write!(f, "{}", reference),
                None => f.write_str("<document>"),
            },
        }
    }
}

#[derive(Debug)]
pub struct TraversalOutcome {
    pub result_set: ResultSet,
    pub report: TraversalReport,
}

/// A resource held in a structural role; pass-through links change the role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct FrontierNode {
    role: String,
    reference: ResourceRef,
}

impl FrontierNode {
    fn held_as_itself(reference: ResourceRef) -> Self {
        Self {
            role: reference.resource_type.clone(),
            reference,
        }
    }
}

/// Mutable state shared by one run's fetch tasks
struct RunContext {
    aggregator: Mutex<ResultAggregator>,
    /// `(link, query)` pairs already sent
    dispatched: Mutex<HashSet<(usize, SearchQuery)>>,
}

impl RunContext {
    /// True the first time a link dispatches this query; repeats are counted as skipped.
    fn claim(&self, link_index: usize, query: &SearchQuery) -> bool {
        let fresh = self
            .dispatched
            .lock()
            .unwrap()
            .insert((link_index, query.clone()));
        if !fresh {
            if let Some(stats) = self.aggregator.lock().unwrap().stats_mut(link_index) {
                stats.queries_skipped += 1;
            }
        }
        fresh
    }
}

struct Job {
    link_index: usize,
    query: SearchQuery,
    sources: Vec<ResourceRef>,
}

enum JobResult {
    /// New refs from every page received, even if a later page failed
    Fetched(Vec<ResourceRef>),
    NotStarted,
}

/// Walks graph definitions against a search API
pub struct TraversalEngine {
    api: Arc<dyn SearchApi>,
}

impl TraversalEngine {
    pub fn new(api: Arc<dyn SearchApi>) -> Self {
        Self { api }
    }

    /// Traverse `definition` starting from `start_type/start_id`.
    ///
    /// Only a broken definition is an error; fetch failures, depth limits and
    /// cancellation are reported in the outcome.
    pub async fn traverse(
        &self,
        definition: &GraphDefinition,
        start_type: &str,
        start_id: &str,
        options: TraversalOptions,
    ) -> Result<TraversalOutcome> {
        let graph = CompiledGraph::compile(definition)?;
        self.run(&graph, StartPoint::Reference(ResourceRef::new(start_type, start_id)), options)
            .await
    }

    pub async fn run(
        &self,
        graph: &CompiledGraph,
        start: StartPoint,
        options: TraversalOptions,
    ) -> Result<TraversalOutcome> {
        let gateway = FetchGateway::new(Arc::clone(&self.api), options.max_pages);
        let ctx = Arc::new(RunContext {
            aggregator: Mutex::new(ResultAggregator::new(graph, start.to_string())),
            dispatched: Mutex::new(HashSet::new()),
        });
        log::info!(
            "Starting traversal of {} from {} (max depth {}, max {} page(s) per query)",
            graph.id,
            start,
            options.max_depth,
            gateway.max_pages()
        );

        let mut frontier = self.seed(&gateway, &ctx, start).await;
        let mut expanded: HashSet<FrontierNode> = HashSet::new();
        let mut depth = 0;
        let mut completion = Completion::Complete;
        let mut state = TraversalState::Pending;

        loop {
            // leaves have nothing left to expand
            frontier.retain(|node| !expanded.contains(node) && graph.links_from(&node.role).next().is_some());
            frontier.sort();
            frontier.dedup();

            if frontier.is_empty() {
                break;
            }
            if options.cancellation.is_cancelled() {
                completion = Completion::Cancelled;
                break;
            }
            if depth >= options.max_depth {
                log::warn!(
                    "Depth limit {} reached with {} node(s) left unexpanded",
                    options.max_depth,
                    frontier.len()
                );
                ctx.aggregator.lock().unwrap().warn(TraversalWarning::DepthExceeded {
                    max_depth: options.max_depth,
                    pending: frontier.len(),
                });
                completion = Completion::DepthLimited;
                break;
            }

            state = transition(state, TraversalState::Expanding, depth);
            expanded.extend(frontier.iter().cloned());
            let (mut next, jobs) = expand(graph, &ctx, &frontier, &options.query_policy)?;

            state = transition(state, TraversalState::Draining, depth);
            let (fetched, cancelled) = drain(&gateway, &ctx, jobs, &options).await;
            next.extend(fetched);
            depth += 1;

            if cancelled {
                completion = Completion::Cancelled;
                break;
            }
            frontier = next;
            state = transition(state, TraversalState::Pending, depth);
        }
        transition(state, TraversalState::Done, depth);

        if completion == Completion::Cancelled {
            log::warn!("Traversal of {} cancelled at depth {}", graph.id, depth);
            ctx.aggregator.lock().unwrap().warn(TraversalWarning::Cancelled { depth });
        }

        let aggregator = std::mem::take(&mut *ctx.aggregator.lock().unwrap());
        let (result_set, report) = aggregator.finalize(completion, depth);
        log::info!(
            "Traversal of {} finished ({:?}): {} resources, {} queries, {} errors",
            graph.id,
            report.completion,
            result_set.len(),
            report.total_queries(),
            report.errors.len()
        );
        Ok(TraversalOutcome { result_set, report })
    }

    /// Load the start documents; their refs form the first frontier.
    async fn seed(&self, gateway: &FetchGateway, ctx: &RunContext, start: StartPoint) -> Vec<FrontierNode> {
        let (documents, failure) = match start {
            StartPoint::Document(document) => (vec![document], None),
            StartPoint::Reference(reference) => match gateway.read(&reference).await {
                Ok(document) => (vec![document], None),
                Err(error) => (Vec::new(), Some((error, vec![reference]))),
            },
            StartPoint::Query(query) => {
                let (outcome, error) = match gateway.execute(&query).await {
                    Ok(outcome) => (outcome, None),
                    Err(partial) => (partial.outcome, Some((partial.error, Vec::new()))),
                };
                let mut documents = outcome.primary;
                documents.extend(outcome.sideloaded);
                (documents, error)
            }
        };

        let mut aggregator = ctx.aggregator.lock().unwrap();
        if let Some((error, sources)) = failure {
            log::warn!("Could not load start: {}", error);
            aggregator.record_error(FetchErrorRecord::new(None, error, sources));
        }
        aggregator
            .record(None, documents)
            .into_iter()
            .map(FrontierNode::held_as_itself)
            .collect()
    }
}

fn transition(from: TraversalState, to: TraversalState, depth: usize) -> TraversalState {
    log::debug!("depth {}: {:?} -> {:?}", depth, from, to);
    to
}

/// Evaluate every link for the frontier: pass-through re-tags go straight
/// into the next frontier, search links become fetch jobs.
fn expand(
    graph: &CompiledGraph,
    ctx: &RunContext,
    frontier: &[FrontierNode],
    policy: &QueryPolicy,
) -> Result<(Vec<FrontierNode>, Vec<Job>)> {
    let mut next = Vec::new();
    let mut jobs = Vec::new();
    let mut aggregator = ctx.aggregator.lock().unwrap();

    for link in &graph.links {
        let sources: Vec<&FrontierNode> = frontier.iter().filter(|n| n.role == link.source_type).collect();
        if sources.is_empty() {
            continue;
        }

        match &link.kind {
            LinkKind::PassThrough => {
                for node in &sources {
                    next.push(FrontierNode {
                        role: link.target_type.clone(),
                        reference: node.reference.clone(),
                    });
                }
                if let Some(stats) = aggregator.stats_mut(link.index) {
                    stats.pass_through += sources.len();
                }
                log::debug!("{}: re-tagged {} resource(s)", link, sources.len());
            }
            LinkKind::Static { template } => {
                jobs.push(Job {
                    link_index: link.index,
                    query: SearchQuery::new(&link.target_type, template.raw()),
                    sources: sources.iter().map(|n| n.reference.clone()).collect(),
                });
            }
            LinkKind::Search { path, template, mode } => {
                let mut values = Vec::new();
                let mut origins: HashMap<String, Vec<ResourceRef>> = HashMap::new();
                let mut empty = 0;
                for node in &sources {
                    let Some(document) = aggregator.result_set().get(&node.reference) else {
                        log::warn!("{}: no document held for {}", link, node.reference);
                        continue;
                    };
                    let resolved = resolve(document, &node.role, path)?;
                    if resolved.is_empty() {
                        empty += 1;
                    }
                    for value in resolved {
                        origins.entry(value.clone()).or_default().push(node.reference.clone());
                        values.push(value);
                    }
                }
                if let Some(stats) = aggregator.stats_mut(link.index) {
                    stats.empty_resolutions += empty;
                }

                let built = build(&link.target_type, template, &values, *mode, policy);
                log::debug!(
                    "{}: {} value(s) from {} source(s) -> {} {:?} quer(ies)",
                    link,
                    values.len(),
                    sources.len(),
                    built.len(),
                    mode
                );
                for query in built {
                    let mut job_sources: Vec<ResourceRef> = query
                        .values
                        .iter()
                        .filter_map(|v| origins.get(v))
                        .flatten()
                        .cloned()
                        .collect();
                    job_sources.sort();
                    job_sources.dedup();
                    jobs.push(Job {
                        link_index: link.index,
                        query: query.query,
                        sources: job_sources,
                    });
                }
            }
        }
    }

    Ok((next, jobs))
}

/// Fetch every job concurrently; returns newly reached nodes and whether
/// the run was cancelled meanwhile.
async fn drain(
    gateway: &FetchGateway,
    ctx: &Arc<RunContext>,
    jobs: Vec<Job>,
    options: &TraversalOptions,
) -> (Vec<FrontierNode>, bool) {
    let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut in_flight: HashMap<Id, (usize, String, Vec<ResourceRef>)> = HashMap::new();

    for job in jobs {
        if !ctx.claim(job.link_index, &job.query) {
            log::debug!("Skipping repeated query {}", job.query);
            continue;
        }
        let meta = (job.link_index, job.query.to_string(), job.sources.clone());
        let handle = tasks.spawn(run_job(
            gateway.clone(),
            Arc::clone(ctx),
            Arc::clone(&semaphore),
            options.cancellation.clone(),
            job,
        ));
        in_flight.insert(handle.id(), meta);
    }

    let mut next = Vec::new();
    let mut cancelled = options.cancellation.is_cancelled();
    let mut abandoned: HashMap<usize, usize> = HashMap::new();

    loop {
        tokio::select! {
            joined = tasks.join_next_with_id() => match joined {
                None => break,
                Some(Ok((id, result))) => {
                    let Some((link_index, _, _)) = in_flight.remove(&id) else {
                        continue;
                    };
                    match result {
                        JobResult::Fetched(new_refs) => {
                            next.extend(new_refs.into_iter().map(FrontierNode::held_as_itself));
                        }
                        JobResult::NotStarted => *abandoned.entry(link_index).or_insert(0) += 1,
                    }
                }
                Some(Err(e)) => {
                    let Some((link_index, query, sources)) = in_flight.remove(&e.id()) else {
                        continue;
                    };
                    if e.is_cancelled() {
                        *abandoned.entry(link_index).or_insert(0) += 1;
                    } else {
                        log::error!("Fetch task for {} panicked: {}", query, e);
                        let error = FetchError::new(query, format!("fetch task failed: {}", e));
                        ctx.aggregator
                            .lock()
                            .unwrap()
                            .record_error(FetchErrorRecord::new(Some(link_index), error, sources));
                    }
                }
            },
            _ = options.cancellation.cancelled(), if !cancelled => {
                cancelled = true;
                match options.cancel_mode {
                    CancelMode::Abandon => {
                        log::warn!("Cancelled: abandoning {} in-flight fetch(es)", tasks.len());
                        tasks.abort_all();
                    }
                    CancelMode::Drain => {
                        log::warn!("Cancelled: draining {} in-flight fetch(es)", tasks.len());
                    }
                }
            }
        }
    }

    if !abandoned.is_empty() {
        let mut aggregator = ctx.aggregator.lock().unwrap();
        for (link_index, count) in abandoned {
            if let Some(stats) = aggregator.stats_mut(link_index) {
                stats.queries_abandoned += count;
            }
        }
    }

    (next, cancelled)
}

async fn run_job(
    gateway: FetchGateway,
    ctx: Arc<RunContext>,
    semaphore: Arc<Semaphore>,
    cancellation: CancellationToken,
    job: Job,
) -> JobResult {
    let permit = tokio::select! {
        biased;
        _ = cancellation.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return JobResult::NotStarted;
    };
    if let Some(stats) = ctx.aggregator.lock().unwrap().stats_mut(job.link_index) {
        stats.queries_issued += 1;
    }

    match gateway.execute(&job.query).await {
        Ok(outcome) => {
            let new_refs = ctx
                .aggregator
                .lock()
                .unwrap()
                .record_fetch(job.link_index, &job.query, outcome);
            JobResult::Fetched(new_refs)
        }
        Err(partial) => {
            log::warn!("{}", partial.error);
            let mut aggregator = ctx.aggregator.lock().unwrap();
            // pages received before the failure still count
            let new_refs = aggregator.record_fetch(job.link_index, &job.query, partial.outcome);
            aggregator.record_error(FetchErrorRecord::new(Some(job.link_index), partial.error, job.sources));
            JobResult::Fetched(new_refs)
        }
    }
}
