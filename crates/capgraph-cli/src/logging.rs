use crate::error::{CliError, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directives for a run. A non-empty `RUST_LOG` overrides the verbosity flags, but
/// `--quiet` keeps only errors.
fn directives(verbosity: u8, quiet: bool, env: Option<&str>) -> String {
    if quiet {
        return "error".to_string();
    }
    if let Some(env) = env.map(str::trim).filter(|e| !e.is_empty()) {
        return env.to_string();
    }
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    level.to_string()
}

fn build_filter(verbosity: u8, quiet: bool, env: Option<&str>) -> Result<EnvFilter> {
    let directives = directives(verbosity, quiet, env);
    EnvFilter::try_new(&directives)
        .map_err(|e| CliError::Argument(format!("invalid log filter '{directives}': {e}")))
}

/// Installs the global subscriber: compact lines on stderr and, with `log_file`, a
/// plain-text copy that also records the emitting thread of every scan worker.
pub fn setup_logging(verbosity: u8, quiet: bool, log_file: Option<PathBuf>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(&path)?;
            Some(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_target(true),
            )
        }
        None => None,
    };

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(verbosity, quiet, env.as_deref())?;

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}
