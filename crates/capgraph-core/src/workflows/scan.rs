use crate::core::models::model::ModelRegistry;
use crate::core::models::params::ParameterPoint;
use crate::engine::config::{ConfigError, ScanConfig};
use crate::engine::dispatch::{FunctorStats, PointEvaluator, PointOutcome, PointStatus};
use crate::engine::error::EngineError;
use crate::engine::graph::{DependencyGraph, NodeId};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::sink::{PrintRecord, ResultSink};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{error, info, instrument, warn};

/// Source of the points to evaluate. Shared by every worker behind a lock.
pub trait ScanDriver: Send {
    fn next_point(&mut self) -> Option<ParameterPoint>;

    /// Called with the outcome of every evaluated point.
    fn report(&mut self, _outcome: &PointOutcome) {}

    /// Number of points still to come, when known.
    fn remaining(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ParameterRange {
    model: String,
    parameter: String,
    low: f64,
    high: f64,
}

/// Draws a fixed number of points uniformly from per-parameter ranges.
#[derive(Debug, Clone)]
pub struct RandomScanner {
    ranges: Vec<ParameterRange>,
    remaining: u64,
    next_id: u64,
    rng: StdRng,
}

impl RandomScanner {
    pub fn new(points: u64, seed: u64) -> Self {
        Self {
            ranges: Vec::new(),
            remaining: points,
            next_id: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Adds a uniform range for one parameter. Bounds may come in either order, but both
    /// and their difference must be finite.
    pub fn range(
        mut self,
        model: &str,
        parameter: &str,
        low: f64,
        high: f64,
    ) -> Result<Self, ConfigError> {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        if !low.is_finite() || !high.is_finite() || !(high - low).is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "range",
                reason: format!("{model}.{parameter} cannot be sampled from [{low}, {high}]"),
            });
        }
        self.ranges.push(ParameterRange {
            model: model.to_string(),
            parameter: parameter.to_string(),
            low,
            high,
        });
        Ok(self)
    }
}

impl ScanDriver for RandomScanner {
    fn next_point(&mut self) -> Option<ParameterPoint> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut point = ParameterPoint::new(self.next_id);
        self.next_id += 1;
        for range in &self.ranges {
            let value = if range.low == range.high {
                range.low
            } else {
                self.rng.gen_range(range.low..range.high)
            };
            point.set(&range.model, &range.parameter, value);
        }
        Some(point)
    }

    fn remaining(&self) -> Option<u64> {
        Some(self.remaining)
    }
}

/// Hands out a fixed list of points, renumbered in list order.
#[derive(Debug, Clone, Default)]
pub struct ListScanner {
    points: VecDeque<ParameterPoint>,
    next_id: u64,
}

impl ListScanner {
    pub fn new(points: Vec<ParameterPoint>) -> Self {
        Self {
            points: points.into(),
            next_id: 0,
        }
    }
}

impl ScanDriver for ListScanner {
    fn next_point(&mut self) -> Option<ParameterPoint> {
        let mut point = self.points.pop_front()?;
        point.set_id(self.next_id);
        self.next_id += 1;
        Some(point)
    }

    fn remaining(&self) -> Option<u64> {
        Some(self.points.len() as u64)
    }
}

/// Runtime statistics of one graph node, summed over every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStats {
    pub node: NodeId,
    pub label: String,
    pub stats: FunctorStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    /// Outcomes of every evaluated point, by point id.
    pub outcomes: Vec<PointOutcome>,
    pub stats: Vec<NodeStats>,
}

impl ScanSummary {
    pub fn valid(&self) -> usize {
        self.count(|s| matches!(s, PointStatus::Valid))
    }

    pub fn invalid(&self) -> usize {
        self.count(|s| matches!(s, PointStatus::Invalid { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, PointStatus::Failed { .. }))
    }

    /// Points that carry at least one suspicious-point flag, whatever their status.
    pub fn suspicious(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.suspicious.is_empty()).count()
    }

    pub fn outcome(&self, point_id: u64) -> Option<&PointOutcome> {
        self.outcomes
            .binary_search_by_key(&point_id, |o| o.point_id)
            .ok()
            .map(|i| &self.outcomes[i])
    }

    /// The valid point with the highest total log-likelihood.
    pub fn best(&self) -> Option<&PointOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.is_valid())
            .filter_map(|o| o.log_likelihood.map(|l| (o, l)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(o, _)| o)
    }

    fn count(&self, pred: impl Fn(&PointStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

struct Worker<'a, 'd> {
    graph: &'a DependencyGraph,
    models: &'a ModelRegistry,
    active: &'a [String],
    driver: &'a Mutex<&'d mut dyn ScanDriver>,
    sink: &'a dyn ResultSink,
    config: &'a ScanConfig,
    reporter: &'a ProgressReporter<'a>,
    outcomes: &'a Mutex<Vec<PointOutcome>>,
}

impl Worker<'_, '_> {
    fn run(&self, rank: usize) -> Vec<FunctorStats> {
        let mut evaluator = PointEvaluator::new(self.graph, &self.config.evaluation, rank);
        loop {
            let Some(point) = self.driver.lock().next_point() else {
                break;
            };
            let outcome = self.evaluate(&mut evaluator, &point, rank);

            self.driver.lock().report(&outcome);
            self.reporter.report(Progress::PointFinished {
                point_id: outcome.point_id,
                valid: outcome.is_valid(),
            });
            self.outcomes.lock().push(outcome);
        }
        evaluator.all_stats().to_vec()
    }

    fn evaluate(
        &self,
        evaluator: &mut PointEvaluator<'_>,
        point: &ParameterPoint,
        rank: usize,
    ) -> PointOutcome {
        if self.config.validate_points {
            if let Err(e) = self.models.validate_point(point, self.active) {
                warn!(point = point.id(), error = %e, "Rejecting malformed parameter point");
                let outcome = PointOutcome {
                    point_id: point.id(),
                    rank,
                    status: PointStatus::Failed {
                        functor: "scanner".to_string(),
                        error: e.to_string(),
                    },
                    log_likelihood: None,
                    suspicious: Vec::new(),
                    loops: Vec::new(),
                };
                if let Err(e) = evaluator.print(&outcome, self.sink) {
                    warn!(point = point.id(), error = %e, "Could not record rejected point");
                }
                return outcome;
            }
        }

        let mut outcome = evaluator.evaluate(point);
        if let Err(e) = evaluator.print(&outcome, self.sink) {
            error!(point = outcome.point_id, error = %e, "Printing a valid point failed");
            outcome.status = PointStatus::Failed {
                functor: "printer".to_string(),
                error: e.to_string(),
            };
            // Records printed before the failure stay in the sink; mark them as void.
            if let Err(e) = self.sink.print(PrintRecord::invalid(&outcome)) {
                warn!(point = outcome.point_id, error = %e, "Could not mark the point as failed");
            }
        }
        outcome
    }
}

/// Evaluates every point `driver` yields on `config.workers` threads.
///
/// Each worker owns its own evaluator and pulls points one at a time. A point that is
/// invalid or fails is recorded and the scan continues; only a failure to set up the
/// workers or to flush the sink ends the scan with an error.
#[instrument(skip_all, name = "scan_workflow")]
pub fn run(
    graph: &DependencyGraph,
    models: &ModelRegistry,
    driver: &mut dyn ScanDriver,
    sink: &dyn ResultSink,
    config: &ScanConfig,
    reporter: &ProgressReporter,
) -> Result<ScanSummary, EngineError> {
    reporter.report(Progress::PhaseStart { name: "Scan" });
    info!(workers = config.workers, "Starting scan.");
    reporter.report(Progress::TaskStart {
        total_steps: driver.remaining().unwrap_or(0),
    });

    let active: Vec<String> = graph.active_models().map(str::to_string).collect();
    let driver = Mutex::new(driver);
    let outcomes = Mutex::new(Vec::new());
    let worker = Worker {
        graph,
        models,
        active: &active,
        driver: &driver,
        sink,
        config,
        reporter,
        outcomes: &outcomes,
    };

    let per_worker = run_workers(&worker, config.workers)?;
    sink.flush()?;
    reporter.report(Progress::TaskFinish);

    let mut outcomes = outcomes.into_inner();
    outcomes.sort_by_key(|o| o.point_id);
    let summary = ScanSummary {
        outcomes,
        stats: merge_stats(graph, &per_worker),
    };

    info!(
        valid = summary.valid(),
        invalid = summary.invalid(),
        failed = summary.failed(),
        "Scan complete."
    );
    reporter.report(Progress::PhaseFinish);
    Ok(summary)
}

#[cfg(feature = "parallel")]
fn run_workers(worker: &Worker<'_, '_>, workers: usize) -> Result<Vec<Vec<FunctorStats>>, EngineError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("scan-worker-{i}"))
        .build()
        .map_err(|e| EngineError::ThreadPool(e.to_string()))?;
    Ok(pool.broadcast(|ctx| worker.run(ctx.index())))
}

#[cfg(not(feature = "parallel"))]
fn run_workers(worker: &Worker<'_, '_>, workers: usize) -> Result<Vec<Vec<FunctorStats>>, EngineError> {
    if workers > 1 {
        warn!(workers, "Built without parallel support; scanning on a single worker.");
    }
    Ok(vec![worker.run(0)])
}

fn merge_stats(graph: &DependencyGraph, per_worker: &[Vec<FunctorStats>]) -> Vec<NodeStats> {
    graph
        .topological_order()
        .iter()
        .map(|&node| {
            let mut stats = FunctorStats::default();
            for worker in per_worker {
                if let Some(s) = worker.get(node.index()) {
                    stats.merge(s);
                }
            }
            NodeStats {
                node,
                label: graph.node(node).label(),
                stats,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_scanner_is_reproducible_and_in_range() {
        let draw = || {
            let mut scanner = RandomScanner::new(5, 11).range("M", "x", 2.0, 1.0).unwrap();
            std::iter::from_fn(|| scanner.next_point()).collect::<Vec<_>>()
        };
        let first = draw();
        assert_eq!(first, draw());
        assert_eq!(first.len(), 5);
        for (i, point) in first.iter().enumerate() {
            assert_eq!(point.id(), i as u64);
            let x = point.get("M", "x").unwrap();
            assert!((1.0..2.0).contains(&x));
        }
    }

    #[test]
    fn degenerate_range_yields_constant() {
        let mut scanner = RandomScanner::new(1, 0).range("M", "x", 3.0, 3.0).unwrap();
        assert_eq!(scanner.next_point().unwrap().get("M", "x"), Some(3.0));
        assert_eq!(scanner.remaining(), Some(0));
        assert!(scanner.next_point().is_none());
    }

    #[test]
    fn unsampleable_ranges_are_rejected() {
        for (low, high) in [
            (f64::MIN, f64::MAX),
            (-1.0e308, 1.0e308),
            (0.0, f64::INFINITY),
            (f64::NAN, 1.0),
        ] {
            let result = RandomScanner::new(1, 0).range("M", "x", low, high);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { field: "range", .. })),
                "[{low}, {high}] should be rejected"
            );
        }
        let mut scanner = RandomScanner::new(1, 0)
            .range("M", "x", -1.0e307, 1.0e307)
            .unwrap();
        assert!(scanner.next_point().and_then(|p| p.get("M", "x")).is_some());
    }

    #[test]
    fn list_scanner_renumbers_points() {
        let mut scanner = ListScanner::new(vec![
            ParameterPoint::new(40).with("M", "x", 1.0),
            ParameterPoint::new(7).with("M", "x", 2.0),
        ]);
        assert_eq!(scanner.remaining(), Some(2));
        let a = scanner.next_point().unwrap();
        let b = scanner.next_point().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert_eq!(b.get("M", "x"), Some(2.0));
        assert!(scanner.next_point().is_none());
    }

    fn outcome(point_id: u64, status: PointStatus, log_likelihood: Option<f64>) -> PointOutcome {
        PointOutcome {
            point_id,
            rank: 0,
            status,
            log_likelihood,
            suspicious: Vec::new(),
            loops: Vec::new(),
        }
    }

    #[test]
    fn summary_counts_and_best_point() {
        let summary = ScanSummary {
            outcomes: vec![
                outcome(0, PointStatus::Valid, Some(-3.0)),
                outcome(1, PointStatus::Valid, Some(-1.0)),
                outcome(
                    2,
                    PointStatus::Invalid {
                        functor: "f".into(),
                        reason: "r".into(),
                    },
                    None,
                ),
                outcome(
                    3,
                    PointStatus::Failed {
                        functor: "g".into(),
                        error: "e".into(),
                    },
                    None,
                ),
            ],
            stats: Vec::new(),
        };
        assert_eq!(
            (summary.valid(), summary.invalid(), summary.failed()),
            (2, 1, 1)
        );
        assert_eq!(summary.best().map(|o| o.point_id), Some(1));
        assert_eq!(summary.outcome(2).map(|o| o.point_id), Some(2));
        assert!(summary.outcome(9).is_none());
    }
}
