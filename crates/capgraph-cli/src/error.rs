use capgraph::engine::error::{EngineError, RegistryError, ResolutionError};
use capgraph::engine::sink::SinkError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Dependency resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Failed to assemble the rollcall: {0}")]
    Registry(#[from] RegistryError),

    #[error("Cannot open result sink: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse file '{path}': {source}", path = path.display())]
    FileParsing {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
