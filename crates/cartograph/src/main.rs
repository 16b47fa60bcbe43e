//! Cartograph driver binary.
//!
//! `cartograph run --target <path>` analyzes a source directory into the
//! knowledge graph. Exit codes: 0 success, 1 partial, 2 failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use cartograph_db::{CartographDb, DbConfig};
use cartograph_graph::SqliteGraphStore;
use cartograph_llm::{HttpLlmClient, LlmClient, ScriptedLlmClient};
use cartograph_logging::{cartograph_home, init_logging, LogConfig};
use cartograph_pipeline::PipelineRunner;
use cartograph_protocol::PipelineConfig;

#[derive(Parser)]
#[command(name = "cartograph", about = "Source-code knowledge graph pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Mirror the log file on stderr
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a directory into the knowledge graph
    Run {
        /// Directory to analyze
        #[arg(long)]
        target: PathBuf,

        /// Relational store URL (overrides CARTOGRAPH_DB)
        #[arg(long)]
        db: Option<String>,

        /// Use canned LLM responses instead of the configured endpoint
        #[arg(long)]
        offline: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(LogConfig {
        app_name: "cartograph",
        verbose: cli.verbose,
    }) {
        eprintln!("Failed to initialize logging: {e:#}");
        std::process::exit(2);
    }

    let code = match cli.command {
        Command::Run { target, db, offline } => match run(target, db, offline) {
            Ok(code) => code,
            Err(e) => {
                error!("{e:#}");
                eprintln!("cartograph: {e:#}");
                2
            }
        },
    };
    std::process::exit(code);
}

fn run(target: PathBuf, db_override: Option<String>, offline: bool) -> Result<i32> {
    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(db) = db_override {
        config.db_url = db;
    }
    if config.db_url.is_empty() {
        let default_path = cartograph_home().join("cartograph.db");
        std::fs::create_dir_all(cartograph_home())?;
        config.db_url = format!("sqlite:{}?mode=rwc", default_path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async move {
        let db = CartographDb::connect(DbConfig::from_url(config.db_url.clone())?)
            .await
            .context("Failed to connect to the relational store")?;

        let llm: Arc<dyn LlmClient> = if offline {
            info!("Offline mode: using canned LLM responses");
            Arc::new(
                ScriptedLlmClient::new()
                    .respond_when("point of interest", r#"{"files": []}"#)
                    .respond_default(r#"{"relationships": []}"#),
            )
        } else {
            Arc::new(
                HttpLlmClient::new(config.llm.clone())
                    .context("LLM endpoint not configured")?,
            )
        };

        let graph = Arc::new(SqliteGraphStore::new(db.pool().clone()).await?);

        let runner = PipelineRunner::new(config, db, llm, graph);

        info!(target = %target.display(), "Starting pipeline run");
        let report = tokio::select! {
            report = runner.run(&target) => report?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting run");
                anyhow::bail!("interrupted");
            }
        };

        println!(
            "files: {} analyzed, {} failed | pois: {} | relationships: {} accepted, {} rejected, {} deferred | graph: {} nodes, {} edges | {} ms",
            report.snapshot.store.files_analyzed,
            report.snapshot.store.files_failed,
            report.snapshot.store.pois,
            report.snapshot.store.candidates_accepted,
            report.snapshot.store.candidates_rejected,
            report.snapshot.store.candidates_deferred,
            report.snapshot.graph_nodes,
            report.snapshot.graph_edges,
            report.elapsed_ms,
        );
        Ok(report.exit_code())
    })
}
