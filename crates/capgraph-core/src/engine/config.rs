use crate::core::options::Options;
use crate::core::types::value::TypeTag;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// A capability the user wants computed, and what to do with its value.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableRequest {
    pub capability: String,
    pub type_tag: Option<TypeTag>,
    pub function: Option<String>,
    pub module: Option<String>,
    /// Values of observables sharing this purpose are summed into the point's log-likelihood.
    pub purpose: String,
    pub printme: bool,
}

impl ObservableRequest {
    pub fn new(capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
            type_tag: None,
            function: None,
            module: None,
            purpose: "Observable".to_string(),
            printme: true,
        }
    }

    pub fn with_type(mut self, type_tag: &str) -> Self {
        self.type_tag = Some(TypeTag::new(type_tag));
        self
    }

    pub fn with_function(mut self, function: &str) -> Self {
        self.function = Some(function.to_string());
        self
    }

    pub fn with_module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    pub fn with_purpose(mut self, purpose: &str) -> Self {
        self.purpose = purpose.to_string();
        self
    }

    pub fn printme(mut self, printme: bool) -> Self {
        self.printme = printme;
        self
    }
}

/// Fields that identify a set of functors. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctorSelector {
    pub capability: Option<String>,
    pub type_tag: Option<TypeTag>,
    pub function: Option<String>,
    pub module: Option<String>,
}

impl FunctorSelector {
    pub fn capability(capability: &str) -> Self {
        Self {
            capability: Some(capability.to_string()),
            ..Self::default()
        }
    }

    pub fn function(mut self, function: &str) -> Self {
        self.function = Some(function.to_string());
        self
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    pub fn with_type(mut self, type_tag: &str) -> Self {
        self.type_tag = Some(TypeTag::new(type_tag));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.capability.is_none()
            && self.type_tag.is_none()
            && self.function.is_none()
            && self.module.is_none()
    }
}

/// Pins a backend requirement to a backend, optionally at a given version or function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendRule {
    /// Requirement tag the rule speaks about. `None` applies to every requirement.
    pub capability: Option<String>,
    pub function: Option<String>,
    pub backend: Option<String>,
    pub version: Option<String>,
}

/// A user rule: a functor selector plus constraints on how the selected functors
/// are resolved and configured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleRule {
    pub selector: FunctorSelector,
    /// Constraints on the providers chosen for the selected functors' dependencies.
    pub dependencies: Vec<FunctorSelector>,
    pub backends: Vec<BackendRule>,
    pub options: Options,
    /// Weak rules only break ties and never remove the last candidate.
    pub weak: bool,
}

impl ModuleRule {
    pub fn new(selector: FunctorSelector) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn dependency(mut self, selector: FunctorSelector) -> Self {
        self.dependencies.push(selector);
        self
    }

    pub fn backend(mut self, rule: BackendRule) -> Self {
        self.backends.push(rule);
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.set(key, value);
        self
    }

    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }
}

/// Order in which an explicit version rule and a backend's default version are consulted
/// when both could decide an ambiguous backend requirement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPrecedence {
    #[default]
    UserFirst,
    DefaultFirst,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionConfig {
    pub prefer_model_specific_functions: bool,
    pub backend_precedence: BackendPrecedence,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            prefer_model_specific_functions: true,
            backend_precedence: BackendPrecedence::UserFirst,
        }
    }
}

/// Per-point evaluation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSettings {
    pub likelihood_purpose: String,
    /// A point whose total log-likelihood is NaN or below this is invalid.
    pub invalid_loglike: f64,
    /// Base seed of the per-point random streams.
    pub seed: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            likelihood_purpose: "LogLike".to_string(),
            invalid_loglike: -1.0e30,
            seed: 0,
        }
    }
}

/// Everything resolution needs besides the registries.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub active_models: Vec<String>,
    pub observables: Vec<ObservableRequest>,
    pub rules: Vec<ModuleRule>,
    pub resolution: ResolutionConfig,
}

impl RunRequest {
    pub fn builder() -> RunRequestBuilder {
        RunRequestBuilder::new()
    }

    /// Requests each capability as a printed observable, with no rules.
    pub fn simple(active_models: &[&str], capabilities: &[&str]) -> Self {
        Self {
            active_models: active_models.iter().map(|m| m.to_string()).collect(),
            observables: capabilities
                .iter()
                .map(|c| ObservableRequest::new(c))
                .collect(),
            rules: Vec::new(),
            resolution: ResolutionConfig::default(),
        }
    }
}

#[derive(Default)]
pub struct RunRequestBuilder {
    active_models: Option<Vec<String>>,
    observables: Vec<ObservableRequest>,
    rules: Vec<ModuleRule>,
    resolution: Option<ResolutionConfig>,
}

impl RunRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_models(mut self, models: Vec<String>) -> Self {
        self.active_models = Some(models);
        self
    }
    pub fn observable(mut self, request: ObservableRequest) -> Self {
        self.observables.push(request);
        self
    }
    pub fn observables(mut self, requests: Vec<ObservableRequest>) -> Self {
        self.observables.extend(requests);
        self
    }
    pub fn rule(mut self, rule: ModuleRule) -> Self {
        self.rules.push(rule);
        self
    }
    pub fn rules(mut self, rules: Vec<ModuleRule>) -> Self {
        self.rules.extend(rules);
        self
    }
    pub fn resolution(mut self, config: ResolutionConfig) -> Self {
        self.resolution = Some(config);
        self
    }

    pub fn build(self) -> Result<RunRequest, ConfigError> {
        let active_models = self
            .active_models
            .ok_or(ConfigError::MissingParameter("active_models"))?;
        if self.observables.is_empty() {
            return Err(ConfigError::MissingParameter("observables"));
        }
        if let Some(rule) = self.rules.iter().find(|r| r.selector.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "rules",
                reason: format!("rule with no selector fields: {rule:?}"),
            });
        }
        Ok(RunRequest {
            active_models,
            observables: self.observables,
            rules: self.rules,
            resolution: self.resolution.unwrap_or_default(),
        })
    }
}

/// Settings of one scan run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    /// Number of scan worker threads, each evaluating whole points.
    pub workers: usize,
    pub evaluation: EvaluationSettings,
    /// Check every point against the declared parameters of the active models first.
    pub validate_points: bool,
}

impl ScanConfig {
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::new()
    }
}

#[derive(Default)]
pub struct ScanConfigBuilder {
    workers: Option<usize>,
    evaluation: Option<EvaluationSettings>,
    validate_points: bool,
}

impl ScanConfigBuilder {
    pub fn new() -> Self {
        Self {
            validate_points: true,
            ..Self::default()
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
    pub fn evaluation(mut self, settings: EvaluationSettings) -> Self {
        self.evaluation = Some(settings);
        self
    }
    pub fn validate_points(mut self, validate: bool) -> Self {
        self.validate_points = validate;
        self
    }

    pub fn build(self) -> Result<ScanConfig, ConfigError> {
        let workers = self.workers.ok_or(ConfigError::MissingParameter("workers"))?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workers",
                reason: "at least one scan worker is required".to_string(),
            });
        }
        Ok(ScanConfig {
            workers,
            evaluation: self.evaluation.unwrap_or_default(),
            validate_points: self.validate_points,
        })
    }
}
