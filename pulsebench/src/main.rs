use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use rama::{
    error::{BoxError, ErrorContext as _},
    graceful,
};

pub mod cmd;
pub mod telemetry;

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// CLI arguments for configuring pulsebench behavior.
#[derive(Debug, Clone, Parser)]
#[command(name = "pulsebench")]
#[command(bin_name = "pulsebench")]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    cmds: CliCommands,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false, global = true)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false, global = true)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o', global = true)]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "SECONDS", default_value_t = 35., global = true)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommands {
    Run(self::cmd::run::RunCommand),
    Discover(self::cmd::discover::DiscoverCommand),
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    self::telemetry::init(&args)?;

    if let Err(err) = run_command(args).await {
        eprintln!("pulsebench: {err}");
        std::process::exit(1);
    }
    Ok(())
}

/// Runs the selected subcommand on a graceful-shutdown tree.
///
/// The tree's signal is either an interrupt or the command finishing on its
/// own, whichever happens first; everything the command spawned then gets
/// `--graceful` seconds to wind down before the process gives up on it.
async fn run_command(args: Args) -> Result<(), BoxError> {
    let grace = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let graceful = graceful::Shutdown::new(async move {
        tokio::select! {
            _ = graceful::default_signal() => {
                tracing::info!("interrupt received, winding down");
            }
            _ = done_rx => {
                tracing::debug!("command finished, winding down");
            }
        }
    });

    let command = graceful.spawn_task_fn(async move |guard| {
        let result = match args.cmds {
            CliCommands::Run(run_args) => self::cmd::run::exec(guard, run_args).await,
            CliCommands::Discover(discover_args) => {
                self::cmd::discover::exec(guard, discover_args).await
            }
        };
        let _ = done_tx.send(());
        result
    });

    match grace {
        Some(limit) => {
            graceful.shutdown_with_limit(limit).await?;
        }
        None => {
            graceful.shutdown().await;
        }
    }

    command.await.context("join command task")??;
    Ok(())
}
