use super::context::{CallContext, LoopScope, Suspicion};
use super::dispatch::call_compute;
use super::error::{ComputationError, LoopError};
use super::graph::{DependencyGraph, NodeId};
use super::iteration::{Iteration, IterationController, LoopControl};
use super::registry::functor::Implementation;
use crate::core::models::params::ParameterPoint;
use crate::core::types::value::Value;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use tracing::{debug, info, instrument, warn};

/// Suspicion code attached to a point whose subsystem loop was halted.
pub const HALTED_SUBSYSTEM_CODE: i32 = 2;

/// Stop once the tallied quantity is known to this relative precision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceCriterion {
    pub tally: String,
    pub target_relative_error: f64,
    pub min_samples: u64,
}

impl ConvergenceCriterion {
    pub fn is_satisfied(&self, tally: &Tally) -> bool {
        tally.get(&self.tally).is_some_and(|m| {
            m.count >= self.min_samples.max(2)
                && m.relative_error()
                    .is_some_and(|err| err <= self.target_relative_error)
        })
    }
}

/// One batch of main iterations planned by a loop manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemPlan {
    pub name: String,
    pub max_iterations: u64,
    pub threads: usize,
    /// Failed main iterations tolerated in a row, counted over all loop ranks.
    pub max_consecutive_failures: u32,
    pub convergence: Option<ConvergenceCriterion>,
    /// Treat a halted subsystem as an invalid point instead of flagging it as suspicious.
    pub invalidate_on_halt: bool,
}

impl SubsystemPlan {
    pub fn new(name: &str, max_iterations: u64) -> Self {
        Self {
            name: name.to_string(),
            max_iterations,
            threads: 1,
            max_consecutive_failures: 0,
            convergence: None,
            invalidate_on_halt: false,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    pub fn with_convergence(mut self, criterion: ConvergenceCriterion) -> Self {
        self.convergence = Some(criterion);
        self
    }

    pub fn invalidating_on_halt(mut self) -> Self {
        self.invalidate_on_halt = true;
        self
    }
}

/// Running weighted sums of one tallied quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Moments {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl Moments {
    pub fn record(&mut self, weight: f64) {
        self.count += 1;
        self.sum += weight;
        self.sum_sq += weight * weight;
    }

    pub fn merge(&mut self, other: &Moments) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Standard error of the mean.
    pub fn std_error(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let variance = ((self.sum_sq / n) - mean * mean).max(0.0) * n / (n - 1.0);
        Some((variance / n).sqrt())
    }

    pub fn relative_error(&self) -> Option<f64> {
        let mean = self.mean()?;
        let err = self.std_error()?;
        (mean != 0.0).then(|| err / mean.abs())
    }
}

/// Named accumulators filled by nested functors during main iterations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Tally(BTreeMap<String, Moments>);

impl Tally {
    pub fn record(&mut self, key: &str, weight: f64) {
        self.0.entry(key.to_string()).or_default().record(weight);
    }

    pub fn merge(&mut self, other: &Tally) {
        for (key, moments) in &other.0 {
            self.0.entry(key.clone()).or_default().merge(moments);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Moments> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Moments)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemOutcome {
    /// Every planned main iteration was issued.
    Completed,
    /// A functor or the convergence criterion called for an early stop.
    Converged,
    /// Stopped early after a failure; partial results were still aggregated.
    Halted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsystemReport {
    pub name: String,
    pub iterations: u64,
    pub failed_iterations: u64,
    pub outcome: SubsystemOutcome,
    pub tally: Tally,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopReport {
    pub manager: String,
    pub subsystems: Vec<SubsystemReport>,
}

impl LoopReport {
    /// The value published for the loop manager's own capability.
    pub fn summary(&self) -> Value {
        let mut map = BTreeMap::new();
        for subsystem in &self.subsystems {
            map.insert(
                format!("{}.iterations", subsystem.name),
                subsystem.iterations as f64,
            );
            map.insert(
                format!("{}.failed_iterations", subsystem.name),
                subsystem.failed_iterations as f64,
            );
        }
        Value::Map(map)
    }
}

/// What a finished loop hands back to the point evaluator.
pub(crate) struct LoopOutput {
    pub report: LoopReport,
    /// Final values of the nested functors, as left by loop rank 0.
    pub values: HashMap<NodeId, Value>,
    pub suspicions: Vec<Suspicion>,
}

/// Per-thread state of one loop rank.
struct RankState {
    values: HashMap<NodeId, Value>,
    tally: Tally,
    rng: StdRng,
    suspicions: Vec<Suspicion>,
}

struct RankRun {
    state: RankState,
    iterations: u64,
    failed: u64,
}

struct SharedProgress<'s> {
    control: &'s LoopControl,
    counter: AtomicU64,
    consecutive_failures: AtomicU32,
    board: Mutex<BTreeMap<usize, Tally>>,
}

impl SharedProgress<'_> {
    fn merged(&self) -> Tally {
        let mut merged = Tally::default();
        for tally in self.board.lock().values() {
            merged.merge(tally);
        }
        merged
    }
}

/// Drives the functors nested in one loop manager through its subsystems.
pub(crate) struct LoopRunner<'a> {
    pub graph: &'a DependencyGraph,
    pub manager: NodeId,
    pub point: &'a ParameterPoint,
    /// Point-level values of everything outside the loop.
    pub values: &'a [Value],
    pub rank: usize,
    pub seed: u64,
}

impl<'a> LoopRunner<'a> {
    fn nested(&self) -> &'a [NodeId] {
        &self.graph.node(self.manager).nested
    }

    fn rank_state(&self, loop_rank: usize, values: HashMap<NodeId, Value>) -> RankState {
        RankState {
            values,
            tally: Tally::default(),
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(loop_rank as u64)),
            suspicions: Vec::new(),
        }
    }

    #[instrument(skip_all, name = "loop", fields(manager = %self.graph.node(self.manager).label()))]
    pub fn run(&self, plans: &[SubsystemPlan]) -> Result<LoopOutput, ComputationError> {
        let mut controller = IterationController::new();
        let initial = self.nested().iter().map(|&id| (id, Value::None)).collect();
        let mut main = self.rank_state(0, initial);
        let idle = LoopControl::new();

        controller.transition(Iteration::BaseInit)?;
        self.run_phase(&mut main, Iteration::BaseInit, &idle, None, 0, None)?;

        let mut subsystems = Vec::with_capacity(plans.len());
        for plan in plans {
            if plan.threads == 0 {
                return Err(LoopError::NoThreads(plan.name.clone()).into());
            }
            let control = LoopControl::new();
            controller.transition(Iteration::SubsystemInit)?;
            main.tally = Tally::default();
            self.run_phase(&mut main, Iteration::SubsystemInit, &control, Some(plan), 0, None)?;

            let runs = self.run_ranks(plan, &control, &main.values)?;

            let mut merged = Tally::default();
            let mut iterations = 0;
            let mut failed = 0;
            let mut rank_values = None;
            for run in runs {
                merged.merge(&run.state.tally);
                iterations += run.iterations;
                failed += run.failed;
                main.suspicions.extend(run.state.suspicions);
                rank_values.get_or_insert(run.state.values);
            }
            if let Some(values) = rank_values {
                main.values = values;
            }
            main.tally = merged.clone();

            controller.transition(Iteration::SubsystemFinalize)?;
            self.run_phase(
                &mut main,
                Iteration::SubsystemFinalize,
                &control,
                Some(plan),
                0,
                Some(&merged),
            )?;

            let outcome = match control.halt_reason() {
                Some(reason) => SubsystemOutcome::Halted(reason),
                None if control.is_done() => SubsystemOutcome::Converged,
                None => SubsystemOutcome::Completed,
            };
            info!(
                subsystem = %plan.name,
                iterations,
                failed,
                outcome = ?outcome,
                "Subsystem finished"
            );
            if let SubsystemOutcome::Halted(reason) = &outcome {
                let message = format!(
                    "subsystem {} halted after {iterations} iterations: {reason}",
                    plan.name
                );
                if plan.invalidate_on_halt {
                    return Err(ComputationError::InvalidPoint(message));
                }
                main.suspicions.push(Suspicion {
                    functor: self.graph.node(self.manager).label(),
                    code: HALTED_SUBSYSTEM_CODE,
                    message,
                });
            }
            subsystems.push(SubsystemReport {
                name: plan.name.clone(),
                iterations,
                failed_iterations: failed,
                outcome,
                tally: merged,
            });
        }

        controller.transition(Iteration::BaseFinalize)?;
        self.run_phase(&mut main, Iteration::BaseFinalize, &idle, None, 0, None)?;
        controller.transition(Iteration::Point)?;

        Ok(LoopOutput {
            report: LoopReport {
                manager: self.graph.node(self.manager).label(),
                subsystems,
            },
            values: main.values,
            suspicions: main.suspicions,
        })
    }

    /// Runs `plan.threads` ranks, each starting from the values left by subsystem init.
    /// Results come back in rank order.
    fn run_ranks(
        &self,
        plan: &SubsystemPlan,
        control: &LoopControl,
        init_values: &HashMap<NodeId, Value>,
    ) -> Result<Vec<RankRun>, ComputationError> {
        let shared = SharedProgress {
            control,
            counter: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            board: Mutex::new(BTreeMap::new()),
        };

        let results: Vec<Result<RankRun, ComputationError>> = thread::scope(|s| {
            let handles: Vec<_> = (0..plan.threads)
                .map(|loop_rank| {
                    let state = self.rank_state(loop_rank, init_values.clone());
                    let shared = &shared;
                    s.spawn(move || self.run_rank(plan, loop_rank, state, shared))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        control.halt("loop worker panicked");
                        Err(LoopError::WorkerPanicked(plan.name.clone()).into())
                    })
                })
                .collect()
        });

        results.into_iter().collect()
    }

    fn run_rank(
        &self,
        plan: &SubsystemPlan,
        loop_rank: usize,
        mut state: RankState,
        shared: &SharedProgress<'_>,
    ) -> Result<RankRun, ComputationError> {
        let mut iterations = 0;
        let mut failed = 0;
        let result = self.rank_loop(plan, loop_rank, &mut state, shared, &mut iterations, &mut failed);
        if let Err(e) = &result {
            shared.control.halt(&e.to_string());
        }
        result.map(|()| RankRun {
            state,
            iterations,
            failed,
        })
    }

    fn rank_loop(
        &self,
        plan: &SubsystemPlan,
        loop_rank: usize,
        state: &mut RankState,
        shared: &SharedProgress<'_>,
        iterations: &mut u64,
        failed: &mut u64,
    ) -> Result<(), ComputationError> {
        let control = shared.control;
        let mut controller = IterationController::for_rank();
        controller.transition(Iteration::StartSubsystem)?;
        self.run_phase(state, Iteration::StartSubsystem, control, Some(plan), loop_rank, None)?;

        while !control.is_done() {
            let n = shared.counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n > plan.max_iterations {
                break;
            }

            let iteration = controller.transition(Iteration::Main(n))?;
            match self.run_phase(state, iteration, control, Some(plan), loop_rank, None) {
                Ok(()) => {
                    shared.consecutive_failures.store(0, Ordering::SeqCst);
                    *iterations += 1;
                }
                Err(ComputationError::IterationFailed(reason)) => {
                    *failed += 1;
                    let consecutive = shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(iteration = n, loop_rank, %reason, "Iteration failed");
                    if consecutive > plan.max_consecutive_failures {
                        warn!(
                            subsystem = %plan.name,
                            consecutive,
                            "Too many consecutive failed iterations; halting subsystem"
                        );
                        control.halt(&format!(
                            "{consecutive} consecutive failed iterations: {reason}"
                        ));
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }

            shared.board.lock().insert(loop_rank, state.tally.clone());
            controller.transition(Iteration::CollectConvergenceData)?;
            self.run_phase(
                state,
                Iteration::CollectConvergenceData,
                control,
                Some(plan),
                loop_rank,
                None,
            )?;

            let merged = shared.merged();
            controller.transition(Iteration::CheckConvergence)?;
            self.run_phase(
                state,
                Iteration::CheckConvergence,
                control,
                Some(plan),
                loop_rank,
                Some(&merged),
            )?;
            if plan
                .convergence
                .as_ref()
                .is_some_and(|c| c.is_satisfied(&merged))
            {
                debug!(subsystem = %plan.name, iteration = n, "Convergence reached");
                control.wrapup();
            }
        }

        controller.transition(Iteration::EndSubsystem)?;
        self.run_phase(state, Iteration::EndSubsystem, control, Some(plan), loop_rank, None)
    }

    /// Calls every nested functor once, in order, for the given phase.
    fn run_phase(
        &self,
        state: &mut RankState,
        iteration: Iteration,
        control: &LoopControl,
        plan: Option<&SubsystemPlan>,
        loop_rank: usize,
        merged: Option<&Tally>,
    ) -> Result<(), ComputationError> {
        for &id in self.nested() {
            let node = self.graph.node(id);
            let Implementation::Compute(f) = &node.implementation else {
                return Err(ComputationError::Failed(format!(
                    "{} is a loop manager nested in another loop, which is not supported",
                    node.label()
                )));
            };
            let mut slot = state.values.remove(&id).unwrap_or_default();
            let result = {
                let mut ctx = CallContext {
                    graph: self.graph,
                    node,
                    point: self.point,
                    values: self.values,
                    iteration,
                    rank: self.rank,
                    scope: Some(LoopScope {
                        control,
                        plan,
                        loop_rank,
                        values: &state.values,
                        tally: &mut state.tally,
                        merged,
                    }),
                    rng: &mut state.rng,
                    suspicions: &mut state.suspicions,
                };
                call_compute(f, &mut ctx, &mut slot)
            };
            state.values.insert(id, slot);
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moments_merge_matches_single_accumulation() {
        let mut all = Moments::default();
        let mut a = Moments::default();
        let mut b = Moments::default();
        for (i, w) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            all.record(w);
            if i % 2 == 0 { a.record(w) } else { b.record(w) }
        }
        a.merge(&b);
        assert_eq!(a, all);
        assert_eq!(all.mean(), Some(2.5));
    }

    #[test]
    fn std_error_needs_two_samples() {
        let mut m = Moments::default();
        m.record(5.0);
        assert_eq!(m.std_error(), None);
        m.record(5.0);
        assert_eq!(m.std_error(), Some(0.0));
        assert_eq!(m.relative_error(), Some(0.0));
    }

    #[test]
    fn convergence_requires_minimum_samples() {
        let criterion = ConvergenceCriterion {
            tally: "xsec".into(),
            target_relative_error: 0.1,
            min_samples: 3,
        };
        let mut tally = Tally::default();
        tally.record("xsec", 1.0);
        tally.record("xsec", 1.0);
        assert!(!criterion.is_satisfied(&tally));
        tally.record("xsec", 1.0);
        assert!(criterion.is_satisfied(&tally));
    }

    #[test]
    fn tally_merge_adds_per_key() {
        let mut a = Tally::default();
        a.record("x", 1.0);
        let mut b = Tally::default();
        b.record("x", 2.0);
        b.record("y", 3.0);
        a.merge(&b);
        assert_eq!(a.get("x").map(|m| m.count), Some(2));
        assert_eq!(a.get("y").map(|m| m.sum), Some(3.0));
    }

    #[test]
    fn report_summary_lists_iterations_per_subsystem() {
        let report = LoopReport {
            manager: "ColliderBit::operate_event_loop".into(),
            subsystems: vec![SubsystemReport {
                name: "LHC_13TeV".into(),
                iterations: 40,
                failed_iterations: 2,
                outcome: SubsystemOutcome::Completed,
                tally: Tally::default(),
            }],
        };
        let summary = report.summary();
        let map = summary.as_map().unwrap();
        assert_eq!(map.get("LHC_13TeV.iterations"), Some(&40.0));
        assert_eq!(map.get("LHC_13TeV.failed_iterations"), Some(&2.0));
    }
}
