use crate::core::models::model::ModelError;
use crate::core::options::OptionError;
use crate::core::types::value::TypeTag;
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

use super::config::ConfigError;
use super::sink::SinkError;

/// A capability together with the type it is requested as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Quantity {
    pub capability: String,
    pub type_tag: Option<TypeTag>,
}

impl Quantity {
    pub fn new(capability: &str, type_tag: Option<&TypeTag>) -> Self {
        Self {
            capability: capability.to_string(),
            type_tag: type_tag.cloned(),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.type_tag {
            Some(tag) => write!(f, "{} [{}]", self.capability, tag),
            None => f.write_str(&self.capability),
        }
    }
}

/// One row of a diagnostic candidate listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSummary {
    pub origin: String,
    pub function: String,
    pub capability: String,
    pub type_tag: String,
    pub status: String,
}

impl fmt::Display for CandidateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} provides {} [{}] ({})",
            self.origin, self.function, self.capability, self.type_tag, self.status
        )
    }
}

fn listing(candidates: &[CandidateSummary]) -> String {
    if candidates.is_empty() {
        return "none".to_string();
    }
    candidates
        .iter()
        .map(|c| format!("\n    {c}"))
        .join("")
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RegistryError {
    #[error("Functor '{origin}::{function}' providing {capability} [{type_tag}] is already registered")]
    DuplicateFunctor {
        origin: String,
        function: String,
        capability: String,
        type_tag: String,
    },
    #[error("Backend function '{backend}' v{version} '{function}' for '{capability}' is already registered")]
    DuplicateBackend {
        backend: String,
        version: String,
        capability: String,
        function: String,
    },
    #[error("No backend function '{capability}' in backend '{backend}' (version {version})")]
    BackendNotFound {
        backend: String,
        version: String,
        capability: String,
    },
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Functor '{0}' is not registered")]
    UnknownFunctor(String),
    #[error("Model declaration failed: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No functor provides {quantity}, required by {required_by}. Disabled candidates: {}", listing(.disabled))]
    MissingProvider {
        quantity: Quantity,
        required_by: String,
        disabled: Vec<CandidateSummary>,
    },

    #[error("Ambiguous resolution of {quantity}, required by {required_by}. Candidates: {}", listing(.candidates))]
    AmbiguousProvider {
        quantity: Quantity,
        required_by: String,
        candidates: Vec<CandidateSummary>,
    },

    #[error("Every functor providing {quantity} (required by {required_by}) is incompatible with the active models [{}]. Candidates: {}", .active_models.join(", "), listing(.candidates))]
    ModelIncompatible {
        quantity: Quantity,
        required_by: String,
        active_models: Vec<String>,
        candidates: Vec<CandidateSummary>,
    },

    #[error("No backend function satisfies requirement '{requirement}' of {functor}. Unusable candidates: {}", listing(.disabled))]
    MissingBackend {
        requirement: String,
        functor: String,
        disabled: Vec<CandidateSummary>,
    },

    #[error("Ambiguous backend for requirement '{requirement}' of {functor}. Candidates: {}", listing(.candidates))]
    AmbiguousBackend {
        requirement: String,
        functor: String,
        candidates: Vec<CandidateSummary>,
    },

    #[error("Circular dependency detected: {}", .chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("{manager} was selected to run the loop of {required_by} but is not a loop manager")]
    NotALoopManager {
        manager: String,
        required_by: String,
    },

    #[error("{nested} is a loop manager and cannot run inside the loop of {manager}")]
    NestedLoopManager { nested: String, manager: String },

    #[error("Model error: {source}")]
    Model {
        #[from]
        source: ModelError,
    },

    #[error("No observables were requested")]
    NothingRequested,
}

/// Errors raised by functors while a point is being evaluated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputationError {
    /// The point lies outside the physically valid region. It is recorded and skipped.
    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    /// One loop iteration failed. Counts towards the subsystem's consecutive-failure limit.
    #[error("Iteration failed: {0}")]
    IterationFailed(String),

    #[error("Dependency '{0}' is not available to this functor")]
    MissingDependency(String),

    #[error("Dependency '{capability}' holds a {found} value, expected {expected}")]
    DependencyType {
        capability: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Backend requirement '{0}' is not bound for this functor")]
    UnboundBackend(String),

    #[error("Backend call failed: {source}")]
    Backend {
        #[from]
        source: BackendCallError,
    },

    #[error("Model '{model}' has no parameter '{parameter}' at this point")]
    MissingParameter { model: String, parameter: String },

    #[error("Option error: {0}")]
    Option(String),

    #[error("Functor panicked: {0}")]
    Panicked(String),

    #[error("Loop error: {source}")]
    Loop {
        #[from]
        source: LoopError,
    },

    #[error("{0}")]
    Failed(String),
}

impl From<OptionError> for ComputationError {
    fn from(e: OptionError) -> Self {
        ComputationError::Option(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendCallError {
    #[error("{function} expects {expected} arguments, got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("{function} argument {index} must be {expected}, got a {found} value")]
    ArgumentType {
        function: String,
        index: usize,
        expected: String,
        found: &'static str,
    },
    #[error("{function} from {backend} v{version} is not callable: {status}")]
    Unavailable {
        backend: String,
        version: String,
        function: String,
        status: String,
    },
    #[error("{function} returned an error: {message}")]
    Failed { function: String, message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoopError {
    #[error("Illegal iteration transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
    #[error("Subsystem '{0}' requested zero worker threads")]
    NoThreads(String),
    #[error("A loop worker thread panicked in subsystem '{0}'")]
    WorkerPanicked(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Dependency resolution failed: {source}")]
    Resolution {
        #[from]
        source: ResolutionError,
    },

    #[error("Model error: {source}")]
    Model {
        #[from]
        source: ModelError,
    },

    #[error("Result sink error: {source}")]
    Sink {
        #[from]
        source: SinkError,
    },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
