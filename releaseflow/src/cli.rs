//! Command-line front-end.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use releaseflow::artifacts::ArtifactStore;
use releaseflow::cancellation::CancellationToken;
use releaseflow::config::{ConfigError, ReleaseConfig};
use releaseflow::context::RunContext;
use releaseflow::events::LoggingEventSink;
use releaseflow::pipeline::{RunReport, StageGraph};
use releaseflow::release::{publish_graph, release_graph, ReleaseTools};
use releaseflow::version::Trigger;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// releaseflow - build, package, validate and publish native libraries
#[derive(Parser, Debug)]
#[command(name = "releaseflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the release configuration file
    #[arg(short, long, default_value = "release.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full release pipeline
    Run(RunArgs),

    /// Re-run only the publisher against the persisted artifact store
    Publish(RunArgs),

    /// Print the stage graph without running it
    Plan,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Git ref that triggered the run, e.g. `refs/tags/v1.2.3`; defaults to `GITHUB_REF`
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Write the JSON run report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Artifact store directory; defaults to `execution.store_dir`
    #[arg(long)]
    pub store: Option<PathBuf>,
}

impl RunArgs {
    fn trigger(&self) -> Result<Trigger> {
        let git_ref = self
            .git_ref
            .clone()
            .or_else(|| std::env::var("GITHUB_REF").ok())
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ConfigError::Validation("no git ref: pass --ref or set GITHUB_REF".to_string()))?;
        Ok(Trigger::from_ref(&git_ref))
    }
}

fn load_config(path: &Path) -> Result<ReleaseConfig> {
    ReleaseConfig::from_file(path).with_context(|| format!("cannot load {}", path.display()))
}

/// Executes the selected command and returns the process exit code.
pub async fn execute(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Plan => {
            let tools = ReleaseTools::from_config(&config)?;
            print!("{}", render_plan(&release_graph(&config, &tools)?));
            Ok(0)
        }
        Commands::Run(args) => run(&config, &args, false).await,
        Commands::Publish(args) => run(&config, &args, true).await,
    }
}

async fn run(config: &ReleaseConfig, args: &RunArgs, publish_only: bool) -> Result<i32> {
    let trigger = args.trigger()?;
    let tools = ReleaseTools::from_config(config)?;
    let graph = if publish_only {
        publish_graph(config, &tools)?
    } else {
        release_graph(config, &tools)?
    };

    let store_dir = args
        .store
        .clone()
        .unwrap_or_else(|| config.resolve(&config.execution.store_dir));
    let store = if publish_only {
        ArtifactStore::load(&store_dir)
            .with_context(|| format!("cannot load artifact store from {}", store_dir.display()))?
    } else {
        ArtifactStore::new()
    };
    let store = Arc::new(store);

    let token = Arc::new(CancellationToken::new());
    token.on_cancel(|| warn!("run cancelled, waiting for in-flight writes to finish"));
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel("interrupted by operator");
        }
    });

    let run = Arc::new(
        RunContext::new(trigger)
            .with_event_sink(Arc::new(LoggingEventSink::debug()))
            .with_artifact_store(store.clone())
            .with_cancellation(token),
    );
    let report = graph.execute(run).await;

    if let Err(err) = store.persist(&store_dir) {
        warn!(dir = %store_dir.display(), error = %err, "cannot persist artifact store");
    } else {
        info!(dir = %store_dir.display(), artifacts = store.artifact_count(), "artifact store persisted");
    }

    print!("{}", report.summary());
    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }
    Ok(report.exit_code())
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_vec_pretty(report).context("cannot serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("cannot write report to {}", path.display()))
}

/// Renders stages in execution order with their joins and preconditions.
pub fn render_plan(graph: &StageGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "pipeline {} ({} stages, {} workers)", graph.name(), graph.stage_count(), graph.workers());
    for name in graph.execution_order() {
        let Some(spec) = graph.stage(name) else {
            continue;
        };
        let deps: Vec<&str> = spec.dependencies.iter().map(String::as_str).collect();
        let _ = write!(out, "  {name:<24} {:<9}", spec.kind.to_string());
        if !deps.is_empty() {
            let _ = write!(out, " after {:?} [{}]", spec.join, deps.join(", "));
        }
        if let Some(condition) = spec.condition {
            let _ = write!(out, " when {condition}");
        }
        out.push('\n');
    }
    out
}

/// Exit code for an error that ended the command early.
pub fn error_exit_code(err: &anyhow::Error) -> i32 {
    let is_setup_error = err.chain().any(|cause| {
        cause.is::<ConfigError>() || cause.is::<releaseflow::errors::PipelineValidationError>()
    });
    if is_setup_error {
        2
    } else {
        1
    }
}
