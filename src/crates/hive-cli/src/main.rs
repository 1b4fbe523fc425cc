//! hive: validate and inspect agent graphs, manage checkpoints.
//!
//! Exit codes: 0 success, 1 unrecoverable failure, 2 configuration
//! validation failure.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hive_checkpoint::{CheckpointStore, FsCheckpointStore};
use hive_core::GraphSpec;
use hive_runtime::RuntimeConfig;
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "hive", version, about = "Goal-driven agent graph runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a graph spec and the runtime configuration.
    Validate {
        /// Path to the graph JSON file.
        graph: PathBuf,
        /// Also require production-only settings (credential key).
        #[arg(long)]
        production: bool,
    },
    /// Print a summary of a graph's nodes and edges.
    Show {
        /// Path to the graph JSON file.
        graph: PathBuf,
    },
    /// Inspect persisted checkpoints.
    #[command(subcommand)]
    Checkpoints(CheckpointCommand),
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// List checkpoints recorded for an execution.
    List {
        execution_id: String,
        /// Checkpoint root; defaults to HIVE_CHECKPOINT_ROOT.
        #[arg(long, env = "HIVE_CHECKPOINT_ROOT")]
        root: Option<PathBuf>,
    },
    /// Print one checkpoint as JSON.
    Show {
        execution_id: String,
        checkpoint_id: String,
        #[arg(long, env = "HIVE_CHECKPOINT_ROOT")]
        root: Option<PathBuf>,
    },
    /// Rebuild an execution's checkpoint index from its snapshots.
    Reconcile {
        execution_id: String,
        #[arg(long, env = "HIVE_CHECKPOINT_ROOT")]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Validate { graph, production } => validate(graph, production).await,
        Command::Show { graph } => show(graph),
        Command::Checkpoints(command) => checkpoints(command).await,
    }
}

async fn validate(path: PathBuf, production: bool) -> anyhow::Result<ExitCode> {
    let config = match RuntimeConfig::from_env().and_then(|c| c.validate(production).map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    match GraphSpec::from_file(&path) {
        Ok(graph) => {
            println!(
                "ok: graph '{}' ({} nodes, {} edges, entry '{}')",
                graph.id,
                graph.nodes.len(),
                graph.edges.len(),
                graph.entry_node
            );
            println!(
                "checkpoint root: {}",
                config.checkpoint_root.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("graph invalid: {e}");
            Ok(ExitCode::from(EXIT_CONFIG))
        }
    }
}

fn show(path: PathBuf) -> anyhow::Result<ExitCode> {
    let graph = GraphSpec::from_file(&path)
        .with_context(|| format!("loading graph from {}", path.display()))?;

    println!("graph {} (goal {})", graph.id, graph.goal_id);
    println!("entry: {}", graph.entry_node);
    println!("terminals: {}", graph.terminal_nodes.join(", "));
    println!("nodes:");
    for node in &graph.nodes {
        let node_type = serde_json::to_value(node.node_type)?
            .as_str()
            .unwrap_or("?")
            .to_string();
        println!(
            "  {:<24} {:<12} in=[{}] out=[{}]",
            node.id,
            node_type,
            node.input_keys.join(","),
            node.output_keys.join(",")
        );
    }
    println!("edges:");
    for edge in &graph.edges {
        let condition: String = edge.condition.clone().into();
        let parallel = if edge.parallel { " [parallel]" } else { "" };
        println!(
            "  {:<12} {} -> {} when {}{}",
            edge.id, edge.source, edge.target, condition, parallel
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn checkpoints(command: CheckpointCommand) -> anyhow::Result<ExitCode> {
    let store_for = |root: Option<PathBuf>| -> anyhow::Result<FsCheckpointStore> {
        let root = match root {
            Some(root) => root,
            None => RuntimeConfig::from_env()
                .map(|c| c.checkpoint_root)
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        };
        Ok(FsCheckpointStore::new(root))
    };

    match command {
        CheckpointCommand::List { execution_id, root } => {
            let store = store_for(root)?;
            let checkpoints = store.list_for(&execution_id).await?;
            if checkpoints.is_empty() {
                println!("no checkpoints for execution {execution_id}");
            }
            for summary in checkpoints {
                println!(
                    "{}  {}  resume at '{}'",
                    summary.id, summary.created_at, summary.resume_node
                );
            }
        }
        CheckpointCommand::Show {
            execution_id,
            checkpoint_id,
            root,
        } => {
            let store = store_for(root)?;
            let checkpoint = store.load(&execution_id, &checkpoint_id).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        CheckpointCommand::Reconcile { execution_id, root } => {
            let store = store_for(root)?;
            let count = store.reconcile(&execution_id).await?;
            println!("rebuilt index for {execution_id}: {count} checkpoints");
        }
    }
    Ok(ExitCode::SUCCESS)
}
