use crate::catalogue;
use crate::cli::RunArgs;
use crate::config::{PartialRunConfig, RunSettings};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use capgraph::engine::progress::{Progress, ProgressReporter};
use capgraph::engine::sink::{JsonLinesSink, MemorySink, ResultSink};
use capgraph::workflows::scan::{self, RandomScanner, ScanSummary};
use tracing::{debug, info, warn};

pub fn run(args: RunArgs) -> Result<()> {
    let partial_config = PartialRunConfig::from_file(&args.source.config)?;
    info!("Merging configuration from file and CLI arguments...");
    let settings = partial_config.merge_with_cli(&args)?;

    let registries = catalogue::rollcall()?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    reporter.report(Progress::PhaseStart {
        name: "Resolving dependencies",
    });
    let graph = registries.resolver().resolve(&settings.request)?;
    reporter.report(Progress::PhaseFinish);
    debug!("\n{}", graph.describe_order());
    info!(
        functors = graph.node_count(),
        backends = graph.required_backends().len(),
        "Dependency graph resolved."
    );

    let mut driver = random_scanner(&settings)?;
    let sink: Box<dyn ResultSink> = match &settings.output {
        Some(path) => {
            info!("Writing records to {:?}", path);
            Box::new(JsonLinesSink::create(path)?)
        }
        None => Box::new(MemorySink::new()),
    };

    println!(
        "Scanning {} point(s) with {} worker(s)...",
        settings.points, settings.scan.workers
    );
    let summary = scan::run(
        &graph,
        &registries.models,
        &mut driver,
        sink.as_ref(),
        &settings.scan,
        &reporter,
    )?;

    report_summary(&summary);
    if let Some(path) = &settings.output {
        println!("✓ Records written to: {}", path.display());
    }
    Ok(())
}

fn random_scanner(settings: &RunSettings) -> Result<RandomScanner> {
    settings
        .ranges
        .iter()
        .try_fold(
            RandomScanner::new(settings.points, settings.seed),
            |driver, r| driver.range(&r.model, &r.parameter, r.low, r.high),
        )
        .map_err(|e| CliError::Config(e.to_string()))
}

fn report_summary(summary: &ScanSummary) {
    println!(
        "Scan complete: {} valid, {} invalid, {} failed, {} flagged suspicious.",
        summary.valid(),
        summary.invalid(),
        summary.failed(),
        summary.suspicious()
    );

    match summary.best() {
        Some(best) => println!(
            "✓ Best point: #{} (lnL = {:.4})",
            best.point_id,
            best.log_likelihood.unwrap_or(f64::NAN)
        ),
        None => {
            warn!("Scan finished without a single valid point.");
            println!("Warning: no valid point was found.");
        }
    }

    for node in &summary.stats {
        let mean = node
            .stats
            .mean_runtime()
            .map_or_else(|| "-".to_string(), |d| format!("{d:?}"));
        info!(
            functor = %node.label,
            calls = node.stats.calls,
            invalidations = node.stats.invalidations,
            mean_runtime = %mean,
            "Functor statistics"
        );
    }
}
