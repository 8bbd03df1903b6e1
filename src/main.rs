use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fhirgraph::definition::{self, CompiledGraph, LinkKind};
use fhirgraph::{
    summarize, Config, GraphDefinition, HttpSearchApi, ResourceDb, ResourceRef, SearchQuery, StartPoint,
    TraversalEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "fhirgraph")]
#[command(about = "Run FHIR GraphDefinition traversals")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Traverse a GraphDefinition from a start resource and store the result set
    Run(RunArgs),
    /// List the bundled GraphDefinitions
    Ls,
    /// Print a YAML summary of a stored result set
    Summarize {
        /// SQLite database written by `run` (defaults to fhirgraph.db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print every stored resource of one type, one JSON document per line
    Resources {
        resource_type: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Base URL of the FHIR server
    #[arg(long, env = "FHIR_BASE")]
    fhir_base_url: Option<String>,

    /// GraphDefinition file path, bundled id (see `ls`) or id on the server
    #[arg(long, conflicts_with = "graph_definition_file_path")]
    graph_definition_id: Option<String>,

    /// Load the GraphDefinition from a YAML or JSON file
    #[arg(long)]
    graph_definition_file_path: Option<PathBuf>,

    /// Start type (defaults to the source type of the first link)
    #[arg(long)]
    start_resource_type: Option<String>,

    #[arg(long, required_unless_present = "start_query")]
    start_resource_id: Option<String>,

    /// Start from every match of a search instead, e.g. `/ResearchStudy?identifier=X`
    #[arg(long, conflicts_with = "start_resource_id")]
    start_query: Option<String>,

    #[arg(long)]
    db_path: Option<PathBuf>,

    #[arg(long)]
    max_depth: Option<usize>,

    #[arg(long)]
    max_pages: Option<usize>,

    /// Validate the definition and exit without fetching
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    let level = match &cli.command {
        Command::Run(args) if args.debug => "debug".to_string(),
        _ => config.fhirgraph.log_level.clone(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", level)).init();

    match cli.command {
        Command::Run(args) => run(&config, args).await,
        Command::Ls => {
            for graph_definition in definition::bundled()? {
                println!(
                    "{} - {}",
                    graph_definition.id,
                    graph_definition.description.as_deref().unwrap_or_default().trim()
                );
            }
            Ok(())
        }
        Command::Summarize { db_path } => {
            let db = existing_db(db_path, &config)?;
            let result_set = db.load_result_set().await?;
            print!("{}", serde_yaml_ng::to_string(&summarize(&result_set))?);
            Ok(())
        }
        Command::Resources { resource_type, db_path } => {
            let db = existing_db(db_path, &config)?;
            for resource in db.all_resources(&resource_type).await? {
                println!("{}", serde_json::to_string(&resource)?);
            }
            Ok(())
        }
    }
}

async fn run(config: &Config, args: RunArgs) -> Result<()> {
    let base_url = args
        .fhir_base_url
        .clone()
        .or_else(|| config.server.base_url.clone())
        .context("No FHIR server: pass --fhir-base-url, set FHIR_BASE or server.base_url")?;
    let api = Arc::new(HttpSearchApi::new(&base_url, &config.server)?);

    let graph_definition = match (&args.graph_definition_file_path, &args.graph_definition_id) {
        (Some(path), _) => GraphDefinition::load(path)
            .with_context(|| format!("Failed to load GraphDefinition from {}", path.display()))?,
        (None, Some(reference)) => definition::resolve(reference, api.as_ref()).await?,
        (None, None) => anyhow::bail!("Provide --graph-definition-id or --graph-definition-file-path"),
    };
    let graph = CompiledGraph::compile(&graph_definition)?;
    eprintln!(
        "{} is a valid GraphDefinition ({} links, {} pass-through)",
        graph.id,
        graph.links.len(),
        graph.links.iter().filter(|l| l.is_pass_through()).count()
    );

    if args.dry_run {
        for link in &graph.links {
            let action = match &link.kind {
                LinkKind::PassThrough => "pass-through".to_string(),
                LinkKind::Static { template } => format!("static {}", template.raw()),
                LinkKind::Search { path, template, mode } => {
                    format!("{:?} {} <- {}", mode, template.raw(), path)
                }
            };
            eprintln!("  {}: {}", link, action);
        }
        eprintln!("Dry run mode enabled. Exiting.");
        return Ok(());
    }

    let start = match (&args.start_query, &args.start_resource_id) {
        (Some(query), _) => StartPoint::Query(SearchQuery::parse(query)?),
        (None, Some(id)) => {
            let start_type = args
                .start_resource_type
                .as_deref()
                .or_else(|| graph_definition.start_type())
                .context("No start type: pass --start-resource-type")?;
            StartPoint::Reference(ResourceRef::new(start_type, id.as_str()))
        }
        (None, None) => anyhow::bail!("Provide --start-resource-id or --start-query"),
    };

    let db = ResourceDb::new(args.db_path.clone().unwrap_or_else(|| config.db_path().to_path_buf()));
    if db.exists() {
        eprintln!(
            "warning: Database already exists at {} and will be used. If this is not what you intended, \
             remove the existing database or pass a new --db-path.",
            db.path().display()
        );
    }

    let mut options = config.traversal_options();
    if let Some(max_depth) = args.max_depth {
        options.max_depth = max_depth;
    }
    if let Some(max_pages) = args.max_pages {
        options.max_pages = max_pages;
    }

    let token = options.cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, finishing in-flight queries");
            token.cancel();
        }
    });

    let started = Instant::now();
    let engine = TraversalEngine::new(api);
    let outcome = engine.run(&graph, start, options).await?;
    let report = &outcome.report;
    log::info!("Traversal took {:.2}s", started.elapsed().as_secs_f64());

    for error in &report.errors {
        log::error!("{} ({})", error.query, error.cause);
    }
    eprint!("{}", serde_yaml_ng::to_string(report)?);

    db.save_result_set(&outcome.result_set).await?;
    eprintln!("Aggregated Results: {:?}", db.count_resource_types().await?);
    eprintln!("database available at: {}", db.path().display());

    if report.partial {
        log::warn!("Result set is partial");
    }
    Ok(())
}

/// Open a result database that `run` has already written
fn existing_db(db_path: Option<PathBuf>, config: &Config) -> Result<ResourceDb> {
    let db = ResourceDb::new(db_path.unwrap_or_else(|| config.db_path().to_path_buf()));
    if !db.exists() {
        anyhow::bail!("No result database at {}", db.path().display());
    }
    Ok(db)
}
