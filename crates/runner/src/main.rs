mod cmd;
mod config;
mod error;
mod project;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a project, install, start the dev server and keep it saved until interrupted
    Run(cmd::RunArgs),
    /// List stored projects, newest first
    List(cmd::ListArgs),
    /// Download a stored project into a directory
    Pull(cmd::PullArgs),
    /// Delete a stored project
    Delete(cmd::DeleteArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the dev server's output.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => cmd::run_session(args).await,
        Command::List(args) => cmd::run_list(args).await,
        Command::Pull(args) => cmd::run_pull(args).await,
        Command::Delete(args) => cmd::run_delete(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
