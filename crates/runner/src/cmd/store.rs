use std::path::PathBuf;

use clap::Args;
use tracing::info;

use super::ConfigArgs;
use crate::error::RunnerResult;
use crate::project;

#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
pub struct PullArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Stored project id
    id: String,
    /// Directory to write the files into
    dest: PathBuf,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Stored project id
    id: String,
}

pub async fn run_list(args: ListArgs) -> RunnerResult<()> {
    let store = args.config.load().await?.open_store()?;
    let projects = store.list().await?;
    if projects.is_empty() {
        println!("no stored projects");
        return Ok(());
    }
    for meta in projects {
        println!(
            "{:<40} {:<24} {} {:>4} files",
            meta.id,
            meta.name,
            meta.created_at.format("%Y-%m-%d %H:%M"),
            meta.files.len()
        );
    }
    Ok(())
}

pub async fn run_pull(args: PullArgs) -> RunnerResult<()> {
    let store = args.config.load().await?.open_store()?;
    let files = store.download(&args.id).await?;
    project::write(&args.dest, &files).await?;
    info!(id = %args.id, files = files.len(), dest = %args.dest.display(), "project pulled");
    Ok(())
}

pub async fn run_delete(args: DeleteArgs) -> RunnerResult<()> {
    let store = args.config.load().await?.open_store()?;
    store.delete(&args.id).await?;
    info!(id = %args.id, store = store.name(), "project deleted");
    Ok(())
}
