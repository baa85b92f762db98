//! Logging bootstrap for the pulsebench binary.

use std::io::IsTerminal as _;

use rama::error::{BoxError, ErrorContext as _};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt::writer::BoxMakeWriter};

use crate::Args;

/// Installs the process-wide tracing subscriber.
///
/// Logs go to stderr so the run/discover summaries printed on stdout stay
/// machine-consumable; `--output` redirects them to a file instead (appending,
/// without ANSI colors). `--verbose` drops the default level to DEBUG, and a
/// `RUST_LOG` directive overrides both.
pub fn init(args: &Args) -> Result<(), BoxError> {
    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let (writer, ansi) = log_writer(args)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    if args.pretty {
        builder.pretty().try_init()?;
    } else {
        builder.try_init()?;
    }

    Ok(())
}

fn log_writer(args: &Args) -> Result<(BoxMakeWriter, bool), BoxError> {
    let Some(path) = args.output.as_deref() else {
        let ansi = std::io::stderr().is_terminal();
        return Ok((BoxMakeWriter::new(std::io::stderr), ansi));
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file '{}'", path.display()))?;
    Ok((BoxMakeWriter::new(file), false))
}
