use super::config::EvaluationSettings;
use super::context::{CallContext, Suspicion};
use super::error::ComputationError;
use super::graph::{DependencyGraph, NodeId};
use super::iteration::Iteration;
use super::loop_manager::{LoopReport, LoopRunner, SubsystemPlan};
use super::registry::functor::{ComputeFn, Implementation, LoopPlanFn};
use super::sink::{PrintRecord, ResultSink, SinkError};
use crate::core::models::params::ParameterPoint;
use crate::core::types::value::Value;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub(crate) fn call_compute(
    f: &ComputeFn,
    ctx: &mut CallContext<'_>,
    result: &mut Value,
) -> Result<(), ComputationError> {
    panic::catch_unwind(AssertUnwindSafe(|| f(ctx, result)))
        .unwrap_or_else(|payload| Err(ComputationError::Panicked(panic_message(payload))))
}

fn call_plan(
    f: &LoopPlanFn,
    ctx: &mut CallContext<'_>,
) -> Result<Vec<SubsystemPlan>, ComputationError> {
    panic::catch_unwind(AssertUnwindSafe(|| f(ctx)))
        .unwrap_or_else(|payload| Err(ComputationError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PointStatus {
    Valid,
    /// The point was rejected by a functor or by the likelihood threshold.
    Invalid { functor: String, reason: String },
    /// A functor failed for reasons unrelated to the physics of the point.
    Failed { functor: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointOutcome {
    pub point_id: u64,
    pub rank: usize,
    #[serde(flatten)]
    pub status: PointStatus,
    pub log_likelihood: Option<f64>,
    pub suspicious: Vec<Suspicion>,
    pub loops: Vec<LoopReport>,
}

impl PointOutcome {
    pub fn is_valid(&self) -> bool {
        self.status == PointStatus::Valid
    }
}

/// Call count and cumulative runtime of one functor on one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FunctorStats {
    pub calls: u64,
    pub invalidations: u64,
    pub runtime: Duration,
}

impl FunctorStats {
    pub fn mean_runtime(&self) -> Option<Duration> {
        (self.calls > 0).then(|| self.runtime.div_f64(self.calls as f64))
    }

    pub fn merge(&mut self, other: &FunctorStats) {
        self.calls += other.calls;
        self.invalidations += other.invalidations;
        self.runtime += other.runtime;
    }
}

/// Evaluates a resolved graph at successive points. Each scan worker owns one.
///
/// The value slots are reset before every point, so nothing computed for one point can be
/// read at the next.
pub struct PointEvaluator<'g> {
    graph: &'g DependencyGraph,
    settings: &'g EvaluationSettings,
    rank: usize,
    values: Vec<Value>,
    stats: Vec<FunctorStats>,
    rng: StdRng,
}

impl<'g> PointEvaluator<'g> {
    pub fn new(graph: &'g DependencyGraph, settings: &'g EvaluationSettings, rank: usize) -> Self {
        Self {
            graph,
            settings,
            rank,
            values: vec![Value::None; graph.node_count()],
            stats: vec![FunctorStats::default(); graph.node_count()],
            rng: StdRng::seed_from_u64(settings.seed),
        }
    }

    pub fn value(&self, node: NodeId) -> &Value {
        &self.values[node.index()]
    }

    pub fn stats(&self, node: NodeId) -> &FunctorStats {
        &self.stats[node.index()]
    }

    pub fn all_stats(&self) -> &[FunctorStats] {
        &self.stats
    }

    pub fn evaluate(&mut self, point: &ParameterPoint) -> PointOutcome {
        self.values.fill(Value::None);
        self.rng = StdRng::seed_from_u64(point_seed(self.settings.seed, point.id()));
        let mut suspicious = Vec::new();
        let mut loops = Vec::new();
        let mut status = PointStatus::Valid;

        for &id in self.graph.topological_order() {
            let node = self.graph.node(id);
            if node.is_nested() {
                continue;
            }
            trace!(functor = %node.label(), point = point.id(), "Calling functor");
            let started = Instant::now();
            let result = match &node.implementation {
                Implementation::Compute(f) => self.compute(id, f, point, &mut suspicious),
                Implementation::LoopManager(f) => self
                    .run_loop(id, f, point, &mut suspicious)
                    .map(|report| loops.push(report)),
            };
            let stats = &mut self.stats[id.index()];
            stats.calls += 1;
            stats.runtime += started.elapsed();

            if let Err(e) = result {
                stats.invalidations += 1;
                status = classify(node.label(), e);
                break;
            }
        }

        let log_likelihood = if status == PointStatus::Valid {
            let total = self.total_log_likelihood();
            if let Some(reason) = self.likelihood_problem(total) {
                status = PointStatus::Invalid {
                    functor: "likelihood".to_string(),
                    reason,
                };
            }
            total
        } else {
            None
        };

        if let PointStatus::Invalid { functor, reason } = &status {
            debug!(point = point.id(), %functor, %reason, "Point invalidated");
        }
        PointOutcome {
            point_id: point.id(),
            rank: self.rank,
            status,
            log_likelihood,
            suspicious,
            loops,
        }
    }

    fn compute(
        &mut self,
        id: NodeId,
        f: &ComputeFn,
        point: &ParameterPoint,
        suspicious: &mut Vec<Suspicion>,
    ) -> Result<(), ComputationError> {
        let mut slot = std::mem::take(&mut self.values[id.index()]);
        let result = {
            let mut ctx = CallContext {
                graph: self.graph,
                node: self.graph.node(id),
                point,
                values: &self.values,
                iteration: Iteration::Point,
                rank: self.rank,
                scope: None,
                rng: &mut self.rng,
                suspicions: suspicious,
            };
            call_compute(f, &mut ctx, &mut slot)
        };
        self.values[id.index()] = slot;
        result
    }

    fn run_loop(
        &mut self,
        id: NodeId,
        f: &LoopPlanFn,
        point: &ParameterPoint,
        suspicious: &mut Vec<Suspicion>,
    ) -> Result<LoopReport, ComputationError> {
        let plans = {
            let mut ctx = CallContext {
                graph: self.graph,
                node: self.graph.node(id),
                point,
                values: &self.values,
                iteration: Iteration::Point,
                rank: self.rank,
                scope: None,
                rng: &mut self.rng,
                suspicions: suspicious,
            };
            call_plan(f, &mut ctx)?
        };

        let runner = LoopRunner {
            graph: self.graph,
            manager: id,
            point,
            values: &self.values,
            rank: self.rank,
            seed: point_seed(self.settings.seed, point.id()).wrapping_add(1),
        };
        let output = runner.run(&plans)?;

        for (nested, value) in output.values {
            self.values[nested.index()] = value;
        }
        suspicious.extend(output.suspicions);
        self.values[id.index()] = output.report.summary();
        Ok(output.report)
    }

    /// Sum of the values of every observable whose purpose is the likelihood purpose.
    fn total_log_likelihood(&self) -> Option<f64> {
        let mut contributions = self
            .graph
            .outputs()
            .filter(|(_, out)| out.purpose == self.settings.likelihood_purpose)
            .map(|(id, _)| self.values[id.index()].as_f64().unwrap_or(f64::NAN))
            .peekable();
        contributions.peek()?;
        Some(contributions.sum())
    }

    fn likelihood_problem(&self, total: Option<f64>) -> Option<String> {
        let total = total?;
        if total.is_nan() {
            Some("NaN returned for likelihood value".to_string())
        } else if total < self.settings.invalid_loglike {
            Some(format!(
                "Cumulative log-likelihood {total} is below the invalid-point threshold {}",
                self.settings.invalid_loglike
            ))
        } else {
            None
        }
    }

    /// Sends every printable output of the last evaluated point to `sink`, together with any
    /// suspicious-point flags.
    ///
    /// A failure is fatal for a valid point; for an already invalid point it is only logged.
    pub fn print(&self, outcome: &PointOutcome, sink: &dyn ResultSink) -> Result<(), SinkError> {
        if !outcome.is_valid() {
            let records = std::iter::once(PrintRecord::invalid(outcome)).chain(
                outcome
                    .suspicious
                    .iter()
                    .map(|s| PrintRecord::suspicious(outcome, s)),
            );
            for record in records {
                if let Err(e) = sink.print(record) {
                    warn!(point = outcome.point_id, error = %e, "Could not record invalid point");
                }
            }
            return Ok(());
        }

        for suspicion in &outcome.suspicious {
            warn!(
                point = outcome.point_id,
                functor = %suspicion.functor,
                code = suspicion.code,
                "{}",
                suspicion.message
            );
            sink.print(PrintRecord::suspicious(outcome, suspicion))?;
        }

        if let Some(total) = outcome.log_likelihood {
            sink.print(PrintRecord {
                value: Value::Float(total),
                label: "LogLike".to_string(),
                capability_id: usize::MAX,
                rank: outcome.rank,
                point_id: outcome.point_id,
            })?;
        }
        for (id, output) in self.graph.outputs() {
            if !output.printme {
                continue;
            }
            sink.print(PrintRecord {
                value: self.values[id.index()].clone(),
                label: output.label.clone(),
                capability_id: output.capability_id,
                rank: outcome.rank,
                point_id: outcome.point_id,
            })?;
        }
        Ok(())
    }
}

fn classify(functor: String, error: ComputationError) -> PointStatus {
    match error {
        ComputationError::InvalidPoint(reason) => PointStatus::Invalid { functor, reason },
        other => {
            warn!(%functor, error = %other, "Functor failed");
            PointStatus::Failed {
                functor,
                error: other.to_string(),
            }
        }
    }
}

/// Random stream seed of one point. Independent of the worker evaluating it, so reruns
/// reproduce a point whichever worker picks it up.
fn point_seed(base: u64, point_id: u64) -> u64 {
    base ^ point_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
