use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use weft_core::{Metric, TaskState};
use weft_engine::{Engine, HotspotSort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LogFormat {
    #[default]
    Human,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Logical-coupling miner for git histories")]
struct Cli {
    #[arg(long, default_value = ".weft", help = "Data directory for mirrors and stores")]
    data_dir: PathBuf,

    #[arg(long, default_value = "human", help = "Log format: human or json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a repository for analysis
    RepoAdd {
        source: PathBuf,
        #[arg(long, help = "Display name; defaults to the directory name")]
        name: Option<String>,
    },
    /// List registered repositories
    RepoList,
    /// Remove a repository and its mirror, store and tables
    RepoRm { repo_id: String },
    /// Create or update a named analysis configuration (JSON document)
    ConfigSet {
        repo_id: String,
        name: String,
        #[arg(help = "Configuration document, e.g. '{\"min_revisions\": 3}'")]
        document: String,
        #[arg(long, help = "Activate the configuration after storing it")]
        activate: bool,
    },
    /// Show the repository's configurations
    ConfigList { repo_id: String },
    /// Activate a stored configuration
    ConfigActivate { repo_id: String, config_id: String },
    /// Queue an analysis run
    Analyze {
        repo_id: String,
        #[arg(long, help = "Configuration id; defaults to the active one")]
        config: Option<String>,
        #[arg(long, help = "Poll progress until the task finishes")]
        follow: bool,
    },
    /// Cancel a running analysis
    Cancel { task_id: String },
    /// List analysis tasks, newest first
    Tasks { repo_id: String },
    /// Top coupled neighbors of a file
    Coupling {
        repo_id: String,
        path: String,
        #[arg(long, default_value = "jaccard")]
        metric: Metric,
        #[arg(long, default_value_t = 0.0)]
        min_weight: f64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Neighborhood graph centered on a file
    Graph {
        repo_id: String,
        path: String,
        #[arg(long, default_value = "jaccard")]
        metric: Metric,
        #[arg(long, default_value_t = 0.0)]
        min_weight: f64,
        #[arg(long, default_value_t = 15)]
        limit: usize,
    },
    /// Risk-scored hotspot listing over files at HEAD
    Hotspots {
        repo_id: String,
        #[arg(long, default_value = "risk")]
        sort: HotspotSort,
        #[arg(long, default_value_t = 0.5, help = "Jaccard threshold for the strong-edge count")]
        threshold: f64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Component-level coupling rollup
    Components {
        repo_id: String,
        #[arg(long, default_value_t = 2)]
        depth: u32,
        #[arg(long, default_value_t = 5)]
        min_cooccurrence: u32,
    },
    /// Run a clustering algorithm over the co-change graph
    Cluster {
        repo_id: String,
        algorithm: String,
        #[arg(help = "Algorithm parameters as JSON", default_value = "{}")]
        params: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let engine = Engine::open(&cli.data_dir).context("failed to open the data directory")?;

    match cli.command {
        Command::RepoAdd { source, name } => {
            let name = name.unwrap_or_else(|| {
                source
                    .file_name()
                    .map(|value| value.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "repository".to_owned())
            });
            let record = engine.create_repository(&source, &name)?;
            print_json(&record)?;
        }
        Command::RepoList => {
            let repositories = engine.list_repositories()?;
            print_json(&repositories)?;
        }
        Command::RepoRm { repo_id } => {
            engine.delete_repository(&repo_id)?;
            println!("removed {repo_id}");
        }
        Command::ConfigSet {
            repo_id,
            name,
            document,
            activate,
        } => {
            let document: serde_json::Value =
                serde_json::from_str(&document).context("configuration must be valid JSON")?;
            let record = engine.upsert_configuration(&repo_id, &name, &document)?;
            if activate {
                engine.activate_configuration(&repo_id, &record.config_id)?;
            }
            print_json(&record)?;
        }
        Command::ConfigList { repo_id } => {
            let configurations = engine.list_configurations(&repo_id)?;
            print_json(&configurations)?;
        }
        Command::ConfigActivate { repo_id, config_id } => {
            engine.activate_configuration(&repo_id, &config_id)?;
            println!("activated {config_id}");
        }
        Command::Analyze {
            repo_id,
            config,
            follow,
        } => {
            let task_id = engine.enqueue_analysis(&repo_id, config.as_deref())?;
            println!("{task_id}");
            if follow {
                follow_progress(&engine, &task_id)?;
            }
        }
        Command::Cancel { task_id } => {
            engine.cancel_analysis(&task_id)?;
            println!("cancel requested for {task_id}");
        }
        Command::Tasks { repo_id } => {
            let tasks = engine.list_tasks(&repo_id)?;
            print_json(&tasks)?;
        }
        Command::Coupling {
            repo_id,
            path,
            metric,
            min_weight,
            limit,
        } => {
            let neighbors = engine.get_coupling(&repo_id, &path, metric, min_weight, limit)?;
            print_json(&neighbors)?;
        }
        Command::Graph {
            repo_id,
            path,
            metric,
            min_weight,
            limit,
        } => {
            let graph = engine.get_coupling_graph(&repo_id, &path, metric, min_weight, limit)?;
            print_json(&graph)?;
        }
        Command::Hotspots {
            repo_id,
            sort,
            threshold,
            limit,
        } => {
            let hotspots = engine.get_hotspots(&repo_id, sort, threshold, limit)?;
            print_json(&hotspots)?;
        }
        Command::Components {
            repo_id,
            depth,
            min_cooccurrence,
        } => {
            let components = engine.get_component_coupling(&repo_id, depth, min_cooccurrence)?;
            print_json(&components)?;
        }
        Command::Cluster {
            repo_id,
            algorithm,
            params,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("parameters must be valid JSON")?;
            let (run, result) = engine.run_clustering(&repo_id, &algorithm, &params)?;
            print_json(&serde_json::json!({ "run": run, "clusters": result.clusters() }))?;
        }
    }

    Ok(())
}

fn follow_progress(engine: &Engine, task_id: &str) -> Result<()> {
    let mut progress = engine.subscribe_progress(task_id)?;
    loop {
        let snapshot = progress.borrow_and_update().clone();
        eprintln!(
            "[{}] {:>5.1}% {} ({} entities, {} edges)",
            snapshot.stage.as_str(),
            snapshot.percent,
            snapshot.message,
            snapshot.entity_count,
            snapshot.relationship_count,
        );
        if snapshot.state.is_terminal() {
            if snapshot.state != TaskState::Completed {
                anyhow::bail!("task ended in state {}", snapshot.state.as_str());
            }
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Human => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
