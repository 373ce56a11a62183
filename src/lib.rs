//! AutoSnippet: a project-local knowledge engine.
//!
//! The engine captures, curates, and serves reusable code-pattern knowledge
//! ("recipes") for an IDE/AI toolchain. Developers and agents submit
//! candidates; a reviewed workflow promotes them into recipes; hybrid
//! retrieval serves them back over a JSON-over-stdio tool protocol and HTTP
//! dashboard contracts.
//!
//! # Architecture
//!
//! - **Source of truth**: the markdown corpus under `AutoSnippet/` in the
//!   project root, managed by git.
//! - **Cache**: a single SQLite file under `.autosnippet/`, rebuildable
//!   end-to-end by replaying sync from the filesystem.
//! - **Gateway**: every state-mutating action passes one choke point that
//!   validates, checks the constitution, probes capabilities, runs hooks,
//!   dispatches, and audits.
//! - **Retrieval**: BM25 keyword scoring plus embedded-chunk cosine
//!   similarity plus authority, merged and optionally AI re-ranked under a
//!   hard fast-abort deadline.
//!
//! # Crate structure
//!
//! - [`core`]: configuration, storage engine, path guard, gateway, protocol
//!   surfaces
//! - [`plugins`]: subsystems (recipes, candidates, snippets, sync, indexer,
//!   search, graph, stats, sessions, audit)
//! - [`constitution`]: the YAML policy document and capability probes

pub mod constitution;
pub mod core;
pub mod plugins;

use crate::core::error::EngineError;
use crate::core::gateway::{DispatchRequest, Gateway};
use crate::core::store::Store;
use crate::core::{assets, paths, rpc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use plugins::{audit, candidates, graph, indexer, recipes, search, snippets, stats, sync};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "asd",
    version = env!("CARGO_PKG_VERSION"),
    about = "Project-local knowledge engine for curated code recipes",
    disable_version_flag = true
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct InitCli {
    /// Directory to initialize (defaults to current working directory).
    #[clap(short, long)]
    dir: Option<PathBuf>,
    /// Overwrite existing template files.
    #[clap(long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct ActCli {
    /// Acting role (resolved against the constitution)
    #[clap(long)]
    actor: String,
    /// Action, e.g. create:recipe or promote:candidate
    #[clap(long)]
    action: String,
    /// JSON parameters for the action
    #[clap(long, default_value = "{}")]
    params: String,
    /// Optional request id for correlation
    #[clap(long)]
    req_id: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SchemaCli {
    /// Optional: filter by subsystem name
    #[clap(long)]
    subsystem: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the knowledge directory and runtime layout
    #[clap(name = "init", visible_alias = "i")]
    Init(InitCli),

    /// Synchronize the markdown corpus with the store database
    #[clap(name = "sync")]
    Sync(sync::SyncCli),

    /// Build or update the semantic and keyword indices
    #[clap(name = "index")]
    Index(indexer::IndexCli),

    /// Hybrid retrieval over the knowledge store
    #[clap(name = "search", visible_alias = "s")]
    Search(search::SearchCli),

    /// Curated knowledge units
    #[clap(name = "recipes", visible_alias = "r")]
    Recipes(recipes::RecipesCli),

    /// Review queue for proposed knowledge units
    #[clap(name = "candidates", visible_alias = "c")]
    Candidates(candidates::CandidatesCli),

    /// Installable code fragments
    #[clap(name = "snippets")]
    Snippets(snippets::SnippetsCli),

    /// Typed knowledge graph over recipes
    #[clap(name = "graph", visible_alias = "g")]
    Graph(graph::GraphCli),

    /// Usage counters and authority scores
    #[clap(name = "stats")]
    Stats(stats::StatsCli),

    /// Audit log and guard checks
    #[clap(name = "audit", visible_alias = "a")]
    Audit(audit::AuditCli),

    /// Dispatch one gateway action
    #[clap(name = "act")]
    Act(ActCli),

    /// Serve the JSON-over-stdio tool protocol
    #[clap(name = "serve")]
    Serve,

    /// Show subsystem schemas
    #[clap(name = "schema")]
    Schema(SchemaCli),

    /// Show version information
    #[clap(name = "version")]
    Version,
}

fn run_init(init: InitCli) -> Result<(), EngineError> {
    let target = match init.dir {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(EngineError::Io)?,
    };
    let target = fs::canonicalize(&target).map_err(EngineError::Io)?;
    let knowledge = target.join(paths::KNOWLEDGE_DIR_NAME);
    fs::create_dir_all(knowledge.join("recipes")).map_err(EngineError::Io)?;
    fs::create_dir_all(knowledge.join("candidates")).map_err(EngineError::Io)?;

    let mut created = 0usize;
    for (name, content) in [
        ("boxspec.json", assets::TEMPLATE_BOXSPEC),
        ("constitution.yaml", assets::TEMPLATE_CONSTITUTION),
    ] {
        let path = knowledge.join(name);
        if path.exists() && !init.force {
            continue;
        }
        fs::write(&path, content).map_err(EngineError::Io)?;
        created += 1;
    }

    // Runtime layout and database come up together.
    let store = Store::open(&target)?;
    crate::core::db::open_store_db(&store)?;

    println!(
        "{} target={} files={} status=ready",
        "init:".green(),
        target.display(),
        created
    );
    Ok(())
}

fn schemas() -> Vec<serde_json::Value> {
    vec![
        crate::core::gateway::schema(),
        crate::constitution::schema(),
        recipes::schema(),
        candidates::schema(),
        snippets::schema(),
        sync::schema(),
        indexer::schema(),
        search::schema(),
        graph::schema(),
        stats::schema(),
        audit::schema(),
    ]
}

pub fn run() -> Result<(), EngineError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Init(init) => return run_init(init),
        Command::Schema(schema_cli) => {
            let all = schemas();
            let selected: Vec<&serde_json::Value> = match &schema_cli.subsystem {
                Some(name) => all.iter().filter(|s| s["name"] == name.as_str()).collect(),
                None => all.iter().collect(),
            };
            if selected.is_empty() {
                return Err(EngineError::Validation(format!(
                    "unknown subsystem '{}'",
                    schema_cli.subsystem.unwrap_or_default()
                )));
            }
            for schema in selected {
                println!(
                    "{}",
                    serde_json::to_string_pretty(schema)
                        .map_err(|e| EngineError::Schema(e.to_string()))?
                );
            }
            return Ok(());
        }
        command => {
            let cwd = std::env::current_dir().map_err(EngineError::Io)?;
            let project_root = paths::resolve_project_root(&cwd)?;
            let store = Store::open(&project_root)?;

            match command {
                Command::Sync(sync_cli) => sync::run_sync_cli(&store, sync_cli)?,
                Command::Index(index_cli) => indexer::run_index_cli(&store, index_cli)?,
                Command::Search(search_cli) => search::run_search_cli(&store, search_cli)?,
                Command::Recipes(recipes_cli) => recipes::run_recipes_cli(&store, recipes_cli)?,
                Command::Candidates(candidates_cli) => {
                    candidates::run_candidates_cli(&store, candidates_cli)?
                }
                Command::Snippets(snippets_cli) => {
                    snippets::run_snippets_cli(&store, snippets_cli)?
                }
                Command::Graph(graph_cli) => graph::run_graph_cli(&store, graph_cli)?,
                Command::Stats(stats_cli) => stats::run_stats_cli(&store, stats_cli)?,
                Command::Audit(audit_cli) => audit::run_audit_cli(&store, audit_cli)?,
                Command::Act(act_cli) => {
                    let params: serde_json::Value = serde_json::from_str(&act_cli.params)
                        .map_err(|e| {
                            EngineError::Validation(format!("--params is not valid JSON: {}", e))
                        })?;
                    let gateway = Gateway::new(store.clone())?;
                    let response = gateway.dispatch(&DispatchRequest {
                        actor: act_cli.actor,
                        action: act_cli.action,
                        resource: String::new(),
                        params,
                        req_id: act_cli.req_id,
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&response)
                            .map_err(|e| EngineError::Schema(e.to_string()))?
                    );
                    if !response.ok {
                        let code = response
                            .error
                            .map(|e| e.code)
                            .unwrap_or_else(|| "Internal".to_string());
                        return Err(EngineError::Internal(format!(
                            "dispatch rejected ({})",
                            code
                        )));
                    }
                }
                Command::Serve => {
                    let gateway = Gateway::new(store.clone())?;
                    let stdin = std::io::stdin();
                    let stdout = std::io::stdout();
                    rpc::serve(&store, &gateway, stdin.lock(), stdout.lock())?;
                }
                Command::Init(_) | Command::Version | Command::Schema(_) => unreachable!(),
            }
        }
    }
    Ok(())
}
