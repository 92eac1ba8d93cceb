use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rill_backend::{Backend, LocalBackend};
use rill_core::{WorkflowSource, WorkflowSubmission};
use rill_engine::{EngineConfig, EngineContext, WorkflowExecution};
use rill_io::PathIo;
use rill_metadata::ChannelPublisher;
use rill_store::SqliteStore;

/// Rill - a workflow execution engine for scientific pipelines
#[derive(Parser)]
#[command(name = "rill")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.rill)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Submit a workflow and drive it to completion
  Run {
    /// Path to the workflow document (JSON)
    workflow_file: PathBuf,

    /// Path to a JSON file with workflow inputs
    #[arg(long)]
    inputs: Option<PathBuf>,

    /// Path to a JSON file with workflow options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Base path for execution products (default: <data-dir>/executions)
    #[arg(long)]
    workflow_root: Option<PathBuf>,
  },

  /// Recover persisted workflows that were interrupted
  Restart,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".rill")
  });

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Commands::Run {
      workflow_file,
      inputs,
      options,
      workflow_root,
    } => rt.block_on(run_workflow(
      workflow_file,
      inputs,
      options,
      workflow_root,
      data_dir,
    )),
    Commands::Restart => rt.block_on(restart(data_dir)),
  }
}

async fn build_context(data_dir: &PathBuf, workflow_root: PathBuf) -> Result<Arc<EngineContext>> {
  std::fs::create_dir_all(data_dir)
    .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

  let store = Arc::new(
    SqliteStore::open(&data_dir.join("rill.db"))
      .await
      .context("failed to open the rill database")?,
  );

  // Metadata drains to the log; a slow sink drops rather than blocking.
  let (publisher, mut events) = ChannelPublisher::bounded(1024);
  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      debug!(
        workflow_id = %event.workflow,
        key = %event.key,
        value = %event.value,
        "metadata"
      );
    }
  });

  let config = EngineConfig {
    workflow_root,
    ..EngineConfig::default()
  };
  Ok(EngineContext::new(
    config,
    store.clone(),
    store,
    Arc::new(Backend::Local(LocalBackend::new())),
    PathIo::standard(),
    Arc::new(publisher),
  ))
}

async fn run_workflow(
  workflow_file: PathBuf,
  inputs: Option<PathBuf>,
  options: Option<PathBuf>,
  workflow_root: Option<PathBuf>,
  data_dir: PathBuf,
) -> Result<()> {
  let source = tokio::fs::read_to_string(&workflow_file)
    .await
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;

  let inputs = match inputs {
    Some(path) => {
      let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read inputs file: {}", path.display()))?;
      serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse inputs file: {}", path.display()))?
    }
    None => serde_json::Map::new(),
  };

  let options = match options {
    Some(path) => {
      let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read options file: {}", path.display()))?;
      serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse options file: {}", path.display()))?
    }
    None => Default::default(),
  };

  let root = workflow_root.unwrap_or_else(|| data_dir.join("executions"));
  let ctx = build_context(&data_dir, root).await?;

  let submission = WorkflowSubmission {
    source: WorkflowSource::Inline(source),
    workflow_root: None,
    inputs,
    options,
    labels: BTreeMap::new(),
    dependencies: None,
  };

  let cancel = CancellationToken::new();
  let aborter = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      eprintln!("abort requested; waiting for calls to stop");
      aborter.cancel();
    }
  });

  let execution = WorkflowExecution::submit(ctx, submission, cancel)
    .await
    .context("submission rejected")?;
  eprintln!("Submitted workflow: {}", execution.id());

  let outcome = execution
    .run()
    .await
    .context("workflow lost durable progress")?;
  eprintln!("Workflow {}: {}", outcome.id, outcome.status.as_str());
  if let Some(failure) = &outcome.failure {
    eprintln!("Failure: {}", failure);
  }

  println!("{}", serde_json::to_string_pretty(&outcome.outputs)?);
  Ok(())
}

async fn restart(data_dir: PathBuf) -> Result<()> {
  let root = data_dir.join("executions");
  let ctx = build_context(&data_dir, root).await?;

  let supervisor = rill_engine::Supervisor::new(ctx);
  let outcomes = supervisor.recover_all().await.context("recovery failed")?;

  if outcomes.is_empty() {
    eprintln!("No workflows to recover");
    return Ok(());
  }
  for outcome in outcomes {
    eprintln!("Workflow {}: {}", outcome.id, outcome.status.as_str());
  }
  Ok(())
}
