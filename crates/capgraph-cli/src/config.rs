pub mod defaults;

use self::defaults::DefaultsConfig;
use crate::cli::RunArgs;
use crate::error::{CliError, Result};
use capgraph::core::options::Options;
use capgraph::engine::config::{
    self as core_config, BackendPrecedence, EvaluationSettings, ObservableRequest, RunRequest,
    ScanConfig,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialScanSection {
    workers: Option<usize>,
    points: Option<u64>,
    seed: Option<u64>,
    output: Option<PathBuf>,
    validate_points: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct PartialRange {
    model: String,
    parameter: String,
    low: f64,
    high: f64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PartialModelsSection {
    active: Vec<String>,
    #[serde(default)]
    ranges: Vec<PartialRange>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct PartialObservable {
    capability: String,
    #[serde(rename = "type")]
    type_tag: Option<String>,
    function: Option<String>,
    module: Option<String>,
    purpose: Option<String>,
    printme: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
struct PartialSelector {
    capability: Option<String>,
    #[serde(rename = "type")]
    type_tag: Option<String>,
    function: Option<String>,
    module: Option<String>,
}

impl From<PartialSelector> for core_config::FunctorSelector {
    fn from(p: PartialSelector) -> Self {
        Self {
            capability: p.capability,
            type_tag: p.type_tag.map(Into::into),
            function: p.function,
            module: p.module,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
struct PartialBackendRule {
    capability: Option<String>,
    function: Option<String>,
    backend: Option<String>,
    version: Option<String>,
}

impl From<PartialBackendRule> for core_config::BackendRule {
    fn from(p: PartialBackendRule) -> Self {
        Self {
            capability: p.capability,
            function: p.function,
            backend: p.backend,
            version: p.version,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
struct PartialRule {
    capability: Option<String>,
    #[serde(rename = "type")]
    type_tag: Option<String>,
    function: Option<String>,
    module: Option<String>,
    #[serde(default)]
    weak: bool,
    #[serde(default)]
    dependencies: Vec<PartialSelector>,
    #[serde(default)]
    backends: Vec<PartialBackendRule>,
    #[serde(default)]
    options: toml::Table,
}

impl From<PartialRule> for core_config::ModuleRule {
    fn from(p: PartialRule) -> Self {
        Self {
            selector: PartialSelector {
                capability: p.capability,
                type_tag: p.type_tag,
                function: p.function,
                module: p.module,
            }
            .into(),
            dependencies: p.dependencies.into_iter().map(Into::into).collect(),
            backends: p.backends.into_iter().map(Into::into).collect(),
            options: Options::from_table(p.options),
            weak: p.weak,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
enum PartialPrecedence {
    UserFirst,
    DefaultFirst,
}

impl From<PartialPrecedence> for BackendPrecedence {
    fn from(p: PartialPrecedence) -> Self {
        match p {
            PartialPrecedence::UserFirst => BackendPrecedence::UserFirst,
            PartialPrecedence::DefaultFirst => BackendPrecedence::DefaultFirst,
        }
    }
}

impl FromStr for PartialPrecedence {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user-first" => Ok(Self::UserFirst),
            "default-first" => Ok(Self::DefaultFirst),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialResolutionSection {
    prefer_model_specific_functions: Option<bool>,
    backend_precedence: Option<PartialPrecedence>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialEvaluationSection {
    likelihood_purpose: Option<String>,
    invalid_loglike: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRunConfig {
    scan: Option<PartialScanSection>,
    models: Option<PartialModelsSection>,
    #[serde(default)]
    observables: Vec<PartialObservable>,
    #[serde(default)]
    rules: Vec<PartialRule>,
    resolution: Option<PartialResolutionSection>,
    evaluation: Option<PartialEvaluationSection>,
}

/// A uniform sampling range for one model parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRange {
    pub model: String,
    pub parameter: String,
    pub low: f64,
    pub high: f64,
}

/// Fully merged settings of a `run` invocation.
#[derive(Debug)]
pub struct RunSettings {
    pub request: RunRequest,
    pub scan: ScanConfig,
    pub points: u64,
    pub seed: u64,
    pub ranges: Vec<ParameterRange>,
    pub output: Option<PathBuf>,
}

impl PartialRunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// CLI flags take precedence over `-S` values, which take precedence over the file.
    pub fn merge_with_cli(mut self, args: &RunArgs) -> Result<RunSettings> {
        self.apply_set_values(&args.source.set_values)?;
        let defaults = DefaultsConfig::default();
        let scan = self.scan.take().unwrap_or_default();

        let seed = args.seed.or(scan.seed).unwrap_or(defaults.seed);
        let evaluation = self.evaluation_settings(&defaults, seed);
        let scan_config = ScanConfig::builder()
            .workers(args.workers.or(scan.workers).unwrap_or(defaults.workers))
            .evaluation(evaluation)
            .validate_points(scan.validate_points.unwrap_or(defaults.validate_points))
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;

        let request = self.build_request(&defaults)?;
        let ranges = self.ranges(&request.active_models)?;

        Ok(RunSettings {
            request,
            scan: scan_config,
            points: args.points.or(scan.points).unwrap_or(defaults.points),
            seed,
            ranges,
            output: args.output.clone().or(scan.output),
        })
    }

    /// Only the resolution part of the configuration, for commands that do not scan.
    pub fn into_request(mut self, set_values: &[String]) -> Result<RunRequest> {
        self.apply_set_values(set_values)?;
        self.build_request(&DefaultsConfig::default())
    }

    fn evaluation_settings(&self, defaults: &DefaultsConfig, seed: u64) -> EvaluationSettings {
        let section = self.evaluation.as_ref();
        EvaluationSettings {
            likelihood_purpose: section
                .and_then(|e| e.likelihood_purpose.clone())
                .unwrap_or_else(|| defaults.likelihood_purpose.clone()),
            invalid_loglike: section
                .and_then(|e| e.invalid_loglike)
                .unwrap_or(defaults.invalid_loglike),
            seed,
        }
    }

    fn build_request(&self, defaults: &DefaultsConfig) -> Result<RunRequest> {
        let models = self
            .models
            .as_ref()
            .ok_or_else(|| CliError::Config("`[models]` section is required.".to_string()))?;
        if self.observables.is_empty() {
            return Err(CliError::Config(
                "At least one `[[observables]]` entry is required.".to_string(),
            ));
        }

        let observables = self
            .observables
            .iter()
            .map(|o| Self::observable(o, defaults))
            .collect();
        let resolution = self.resolution.as_ref();
        let resolution = core_config::ResolutionConfig {
            prefer_model_specific_functions: resolution
                .and_then(|r| r.prefer_model_specific_functions)
                .unwrap_or(defaults.prefer_model_specific_functions),
            backend_precedence: resolution
                .and_then(|r| r.backend_precedence)
                .map(Into::into)
                .unwrap_or_default(),
        };

        RunRequest::builder()
            .active_models(models.active.clone())
            .observables(observables)
            .rules(self.rules.iter().cloned().map(Into::into).collect())
            .resolution(resolution)
            .build()
            .map_err(|e| CliError::Config(e.to_string()))
    }

    fn observable(p: &PartialObservable, defaults: &DefaultsConfig) -> ObservableRequest {
        let mut request = ObservableRequest::new(&p.capability)
            .with_purpose(p.purpose.as_deref().unwrap_or(&defaults.observable_purpose))
            .printme(p.printme.unwrap_or(true));
        if let Some(type_tag) = &p.type_tag {
            request = request.with_type(type_tag);
        }
        if let Some(function) = &p.function {
            request = request.with_function(function);
        }
        if let Some(module) = &p.module {
            request = request.with_module(module);
        }
        request
    }

    fn ranges(&self, active: &[String]) -> Result<Vec<ParameterRange>> {
        let Some(models) = &self.models else {
            return Ok(Vec::new());
        };
        models
            .ranges
            .iter()
            .map(|r| {
                if !active.contains(&r.model) {
                    return Err(CliError::Config(format!(
                        "Range for '{}.{}' names a model that is not active.",
                        r.model, r.parameter
                    )));
                }
                if !r.low.is_finite() || !r.high.is_finite() || !(r.high - r.low).is_finite() {
                    return Err(CliError::Config(format!(
                        "Range for '{}.{}' must have finite bounds and width.",
                        r.model, r.parameter
                    )));
                }
                Ok(ParameterRange {
                    model: r.model.clone(),
                    parameter: r.parameter.clone(),
                    low: r.low,
                    high: r.high,
                })
            })
            .collect()
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value_str)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };

            match key {
                "scan.workers" => {
                    self.scan_section().workers = Some(parse_value(key, value_str, "integer")?);
                }
                "scan.points" => {
                    self.scan_section().points = Some(parse_value(key, value_str, "integer")?);
                }
                "scan.seed" => {
                    self.scan_section().seed = Some(parse_value(key, value_str, "integer")?);
                }
                "scan.output" => {
                    self.scan_section().output = Some(PathBuf::from(value_str));
                }
                "scan.validate-points" => {
                    self.scan_section().validate_points =
                        Some(parse_value(key, value_str, "boolean")?);
                }
                "evaluation.likelihood-purpose" => {
                    self.evaluation
                        .get_or_insert_with(Default::default)
                        .likelihood_purpose = Some(value_str.to_string());
                }
                "evaluation.invalid-loglike" => {
                    self.evaluation
                        .get_or_insert_with(Default::default)
                        .invalid_loglike = Some(parse_value(key, value_str, "float")?);
                }
                "resolution.prefer-model-specific-functions" => {
                    self.resolution
                        .get_or_insert_with(Default::default)
                        .prefer_model_specific_functions =
                        Some(parse_value(key, value_str, "boolean")?);
                }
                "resolution.backend-precedence" => {
                    self.resolution
                        .get_or_insert_with(Default::default)
                        .backend_precedence = Some(parse_value(
                        key,
                        value_str,
                        "precedence ('user-first' or 'default-first')",
                    )?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn scan_section(&mut self) -> &mut PartialScanSection {
        self.scan.get_or_insert_with(Default::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str, kind: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid {kind} value for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const MINIMAL: &str = r#"
        [models]
        active = ["ScalarSinglet"]

        [[models.ranges]]
        model = "ScalarSinglet"
        parameter = "mS"
        low = 10.0
        high = 150.0

        [[observables]]
        capability = "lnL_oh2"
        purpose = "LogLike"
    "#;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("run.toml");
        fs::write(&path, content).unwrap();
        path
    }

    fn run_args(config: &Path, extra: &[&str]) -> RunArgs {
        let mut argv = vec!["capgraph", "run", "-c", config.to_str().unwrap()];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Run(args) => args,
            other => panic!("expected 'run', got {other:?}"),
        }
    }

    fn settings(content: &str, extra: &[&str]) -> Result<RunSettings> {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, content);
        let args = run_args(&path, extra);
        PartialRunConfig::from_file(&path)?.merge_with_cli(&args)
    }

    #[test]
    fn minimal_file_is_completed_with_defaults() {
        let settings = settings(MINIMAL, &[]).unwrap();
        let defaults = DefaultsConfig::default();

        assert_eq!(settings.request.active_models, vec!["ScalarSinglet"]);
        assert_eq!(settings.request.observables.len(), 1);
        assert_eq!(settings.request.observables[0].purpose, "LogLike");
        assert!(settings.request.observables[0].printme);
        assert!(settings.request.resolution.prefer_model_specific_functions);
        assert_eq!(
            settings.request.resolution.backend_precedence,
            BackendPrecedence::UserFirst
        );
        assert_eq!(settings.points, defaults.points);
        assert_eq!(settings.scan.workers, defaults.workers);
        assert!(settings.scan.validate_points);
        assert_eq!(settings.scan.evaluation.invalid_loglike, -1.0e30);
        assert_eq!(settings.output, None);
        assert_eq!(
            settings.ranges,
            vec![ParameterRange {
                model: "ScalarSinglet".into(),
                parameter: "mS".into(),
                low: 10.0,
                high: 150.0,
            }]
        );
    }

    #[test]
    fn cli_flags_override_set_values_and_file() {
        let content = format!(
            "{MINIMAL}\n[scan]\nworkers = 2\npoints = 10\nseed = 4\noutput = \"file.jsonl\"\n"
        );
        let settings = settings(
            &content,
            &["-S", "scan.points=20", "-S", "scan.seed=5", "-n", "30", "-o", "cli.jsonl"],
        )
        .unwrap();

        assert_eq!(settings.scan.workers, 2);
        assert_eq!(settings.points, 30);
        assert_eq!(settings.seed, 5);
        assert_eq!(settings.scan.evaluation.seed, 5);
        assert_eq!(settings.output, Some(PathBuf::from("cli.jsonl")));
    }

    #[test]
    fn rules_and_resolution_sections_are_converted() {
        let content = format!(
            r#"{MINIMAL}
            [resolution]
            prefer-model-specific-functions = false
            backend-precedence = "default-first"

            [evaluation]
            invalid-loglike = -50.0

            [[rules]]
            capability = "RD_oh2"
            function = "RD_oh2_micrOMEGAs"
            weak = true
            options = {{ tolerance = 0.01 }}

            [[rules.dependencies]]
            capability = "spectrum"
            module = "SpecBit"

            [[rules.backends]]
            capability = "oh2"
            backend = "MicrOmegasToy"
            version = "3.6"
            "#
        );
        let settings = settings(&content, &[]).unwrap();
        let request = &settings.request;

        assert!(!request.resolution.prefer_model_specific_functions);
        assert_eq!(
            request.resolution.backend_precedence,
            BackendPrecedence::DefaultFirst
        );
        assert_eq!(settings.scan.evaluation.invalid_loglike, -50.0);

        let rule = &request.rules[0];
        assert!(rule.weak);
        assert_eq!(rule.selector.capability.as_deref(), Some("RD_oh2"));
        assert_eq!(rule.selector.function.as_deref(), Some("RD_oh2_micrOMEGAs"));
        assert_eq!(rule.dependencies[0].module.as_deref(), Some("SpecBit"));
        assert_eq!(rule.backends[0].version.as_deref(), Some("3.6"));
        assert_eq!(rule.options.get::<f64>("tolerance").unwrap(), Some(0.01));
    }

    #[test]
    fn set_values_reach_every_section() {
        let settings = settings(
            MINIMAL,
            &[
                "-S",
                "resolution.backend-precedence=default-first",
                "-S",
                "evaluation.likelihood-purpose=Chi2",
                "-S",
                "scan.validate-points=false",
            ],
        )
        .unwrap();
        assert_eq!(
            settings.request.resolution.backend_precedence,
            BackendPrecedence::DefaultFirst
        );
        assert_eq!(settings.scan.evaluation.likelihood_purpose, "Chi2");
        assert!(!settings.scan.validate_points);
    }

    #[test]
    fn malformed_set_values_are_rejected() {
        for bad in [
            "scan.points",
            "scan.points=many",
            "scan.colour=blue",
            "resolution.backend-precedence=whatever",
        ] {
            let result = settings(MINIMAL, &["-S", bad]);
            assert!(
                matches!(result, Err(CliError::Config(_))),
                "'{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn unknown_keys_in_the_file_fail_to_parse() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[scan]\nthreads = 4\n");
        let result = PartialRunConfig::from_file(&path);
        assert!(matches!(result, Err(CliError::FileParsing { .. })));
    }

    #[test]
    fn missing_sections_are_reported() {
        let no_models = "[[observables]]\ncapability = \"lnL_oh2\"\n";
        assert!(matches!(settings(no_models, &[]), Err(CliError::Config(_))));

        let no_observables = "[models]\nactive = [\"ScalarSinglet\"]\n";
        assert!(matches!(
            settings(no_observables, &[]),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn ranges_must_belong_to_active_models() {
        let content = MINIMAL.replace("model = \"ScalarSinglet\"", "model = \"MSSM\"");
        let result = settings(&content, &[]);
        assert!(matches!(result, Err(CliError::Config(msg)) if msg.contains("MSSM.mS")));
    }

    #[test]
    fn ranges_too_wide_to_sample_are_rejected() {
        let content = MINIMAL
            .replace("low = 10.0", "low = -1.0e308")
            .replace("high = 150.0", "high = 1.0e308");
        let result = settings(&content, &[]);
        assert!(matches!(result, Err(CliError::Config(msg)) if msg.contains("finite bounds")));
    }

    #[test]
    fn bundled_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/toy_scan.toml");
        let args = run_args(&path, &["-j", "1"]);
        let settings = PartialRunConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args)
            .unwrap();

        assert_eq!(settings.scan.workers, 1);
        assert_eq!(settings.points, 200);
        assert_eq!(settings.ranges.len(), 2);
        assert_eq!(settings.request.observables.len(), 4);
        let run_mc = &settings.request.rules[0];
        assert_eq!(run_mc.options.get::<u64>("events").unwrap(), Some(300));
    }

    #[test]
    fn request_only_conversion_applies_set_values() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, MINIMAL);
        let request = PartialRunConfig::from_file(&path)
            .unwrap()
            .into_request(&["resolution.prefer-model-specific-functions=false".to_string()])
            .unwrap();
        assert!(!request.resolution.prefer_model_specific_functions);
        assert_eq!(request.observables[0].capability, "lnL_oh2");
    }
}
