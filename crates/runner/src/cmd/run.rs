use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use project_store::ProjectStore;
use sandbox_local::LocalRuntime;
use tracing::{info, warn};
use workbench::notify::OutputSink;
use workbench::{FileTree, Orchestrator, WorkbenchError};

use super::ConfigArgs;
use crate::error::{RunnerError, RunnerResult};
use crate::project::{self, LoadedProject};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Project directory, or a JSON file `{"files": {"<path>": "<contents>"}}`
    #[arg(required_unless_present = "stored", conflicts_with = "stored")]
    source: Option<PathBuf>,
    /// Run a project from the store instead of a local source
    #[arg(long)]
    stored: Option<String>,
    /// Project name (defaults to the source's file or directory name)
    #[arg(long)]
    name: Option<String>,
    /// Retries after a retryable failure
    #[arg(long, default_value_t = 0)]
    retries: u32,
}

/// Run one session until SIGINT/SIGTERM, then save and tear down.
pub async fn run_session(args: RunArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    let store = config.open_store()?;

    let project = match (&args.source, &args.stored) {
        (Some(source), _) => project::load(source).await?,
        (None, Some(id)) => load_stored(store.as_ref(), id).await?,
        (None, None) => {
            return Err(RunnerError::Config(
                "either a source or --stored is required".into(),
            ));
        }
    };
    let name = args.name.unwrap_or(project.name);
    let tree = FileTree::from_flat(&project.files)?;

    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .map_err(|e| {
            RunnerError::Config(format!("create base_dir {}: {e}", config.base_dir.display()))
        })?;

    let runtime = Arc::new(LocalRuntime::new(config.local_config()));
    let orchestrator = Orchestrator::new(config.session, runtime, store, stdout_sink())?;

    info!(project = %name, files = tree.file_count(), "starting session");
    if let Err(e) = start(&orchestrator, &name, tree, args.retries).await {
        if let Some(output) = e.diagnostic() {
            eprintln!("--- output ---\n{output}\n--------------");
        }
        orchestrator.shutdown().await;
        return Err(e.into());
    }

    match orchestrator.server_url() {
        Some(url) => info!(url = %url, "dev server ready, press Ctrl-C to stop"),
        None => info!("dev server ready, press Ctrl-C to stop"),
    }

    wait_for_signal().await;

    match orchestrator.save_now().await {
        Ok(receipt) => info!(
            project_id = %receipt.project_id,
            files = receipt.stored_paths.len(),
            "final save"
        ),
        Err(e) => warn!(error = %e, "final save failed"),
    }
    orchestrator.shutdown().await;
    Ok(())
}

async fn start(
    orchestrator: &Orchestrator,
    name: &str,
    tree: FileTree,
    retries: u32,
) -> Result<(), WorkbenchError> {
    let mut result = orchestrator.start(name, tree).await;
    let mut attempt = 0;
    while let Err(e) = &result
        && e.is_retryable()
        && attempt < retries
    {
        attempt += 1;
        warn!(attempt, error = %e, "session failed, retrying");
        result = orchestrator.retry().await;
    }
    result
}

async fn load_stored(store: &dyn ProjectStore, id: &str) -> RunnerResult<LoadedProject> {
    let files = store.download(id).await?;
    let name = store
        .list()
        .await?
        .into_iter()
        .find(|meta| meta.id == id)
        .map_or_else(|| id.to_owned(), |meta| meta.name);
    Ok(LoadedProject { name, files })
}

fn stdout_sink() -> OutputSink {
    Arc::new(|chunk: &[u8]| {
        let mut out = std::io::stdout().lock();
        // A closed stdout must not take the session down.
        let _ = out.write_all(chunk).and_then(|()| out.flush());
    })
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            info!("received SIGTERM, shutting down");
        }
        _ = recv_signal(&mut sigint) => {
            info!("received SIGINT, shutting down");
        }
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
