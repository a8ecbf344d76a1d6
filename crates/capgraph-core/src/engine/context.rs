use super::error::ComputationError;
use super::graph::{DependencyGraph, GraphNode, NodeId};
use super::iteration::{Iteration, LoopControl};
use super::loop_manager::{SubsystemPlan, Tally};
use super::registry::backend::BackendHandle;
use crate::core::models::params::ParameterPoint;
use crate::core::options::Options;
use crate::core::types::value::Value;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A non-fatal problem a functor noticed at the current point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suspicion {
    pub functor: String,
    pub code: i32,
    pub message: String,
}

/// Loop state visible to a functor nested in a loop manager.
pub(crate) struct LoopScope<'a> {
    pub control: &'a LoopControl,
    pub plan: Option<&'a SubsystemPlan>,
    pub loop_rank: usize,
    /// Rank-local values of the functors nested in the same loop.
    pub values: &'a HashMap<NodeId, Value>,
    /// Rank-local accumulator.
    pub tally: &'a mut Tally,
    /// All ranks' published tallies, merged, once they are available.
    pub merged: Option<&'a Tally>,
}

/// Everything a functor may touch while it is being called.
pub struct CallContext<'a> {
    pub(crate) graph: &'a DependencyGraph,
    pub(crate) node: &'a GraphNode,
    pub(crate) point: &'a ParameterPoint,
    pub(crate) values: &'a [Value],
    pub(crate) iteration: Iteration,
    pub(crate) rank: usize,
    pub(crate) scope: Option<LoopScope<'a>>,
    pub(crate) rng: &'a mut StdRng,
    pub(crate) suspicions: &'a mut Vec<Suspicion>,
}

impl<'a> CallContext<'a> {
    pub fn label(&self) -> String {
        self.node.label()
    }

    pub fn point_id(&self) -> u64 {
        self.point.id()
    }

    pub fn iteration(&self) -> Iteration {
        self.iteration
    }

    /// Rank of the scan worker evaluating this point.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Rank of the loop thread running this call, when nested in a loop.
    pub fn loop_rank(&self) -> Option<usize> {
        self.scope.as_ref().map(|s| s.loop_rank)
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.scope
            .as_ref()
            .and_then(|s| s.plan)
            .map(|p| p.name.as_str())
    }

    pub fn options(&self) -> &Options {
        &self.node.options
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut *self.rng
    }

    pub fn dependency(&self, capability: &str) -> Result<&Value, ComputationError> {
        let dep = self
            .node
            .dependencies
            .iter()
            .find(|d| d.capability == capability)
            .ok_or_else(|| ComputationError::MissingDependency(capability.to_string()))?;
        if let Some(value) = self.scope.as_ref().and_then(|s| s.values.get(&dep.node)) {
            return Ok(value);
        }
        self.values
            .get(dep.node.index())
            .ok_or_else(|| ComputationError::MissingDependency(capability.to_string()))
    }

    pub fn dep_f64(&self, capability: &str) -> Result<f64, ComputationError> {
        let value = self.dependency(capability)?;
        value.as_f64().ok_or(ComputationError::DependencyType {
            capability: capability.to_string(),
            expected: "float",
            found: value.kind(),
        })
    }

    pub fn dep_map(&self, capability: &str) -> Result<&BTreeMap<String, f64>, ComputationError> {
        let value = self.dependency(capability)?;
        value.as_map().ok_or(ComputationError::DependencyType {
            capability: capability.to_string(),
            expected: "map",
            found: value.kind(),
        })
    }

    pub fn backend(&self, requirement: &str) -> Result<&BackendHandle, ComputationError> {
        self.node
            .backends
            .get(requirement)
            .ok_or_else(|| ComputationError::UnboundBackend(requirement.to_string()))
    }

    /// Parameters of `model` at this point. When `model` is not active itself, the values of
    /// the active model descending from it are used.
    pub fn parameters(&self, model: &str) -> Result<&BTreeMap<String, f64>, ComputationError> {
        self.point
            .model_parameters(model)
            .or_else(|| {
                self.graph
                    .active_descendant_of(model)
                    .and_then(|m| self.point.model_parameters(m))
            })
            .ok_or_else(|| ComputationError::MissingParameter {
                model: model.to_string(),
                parameter: "*".to_string(),
            })
    }

    pub fn parameter(&self, model: &str, name: &str) -> Result<f64, ComputationError> {
        self.parameters(model)?
            .get(name)
            .copied()
            .ok_or_else(|| ComputationError::MissingParameter {
                model: model.to_string(),
                parameter: name.to_string(),
            })
    }

    /// Asks the enclosing loop to stop issuing main iterations.
    pub fn wrapup(&self) {
        match &self.scope {
            Some(scope) => scope.control.wrapup(),
            None => debug!(functor = %self.label(), "wrapup requested outside a loop"),
        }
    }

    /// Stops the enclosing loop and marks the subsystem as aborted.
    pub fn halt(&self, reason: &str) {
        match &self.scope {
            Some(scope) => scope.control.halt(reason),
            None => warn!(functor = %self.label(), %reason, "halt requested outside a loop"),
        }
    }

    pub fn is_wrapping_up(&self) -> bool {
        self.scope.as_ref().is_some_and(|s| s.control.is_done())
    }

    /// Adds a weighted sample to the rank-local tally under `key`.
    pub fn record(&mut self, key: &str, weight: f64) {
        match &mut self.scope {
            Some(scope) => scope.tally.record(key, weight),
            None => debug!(functor = %self.node.label(), key, "record called outside a loop"),
        }
    }

    /// The merged tally of every rank when it is available, otherwise this rank's own.
    pub fn tally(&self) -> Option<&Tally> {
        self.scope
            .as_ref()
            .map(|s| s.merged.unwrap_or(&*s.tally))
    }

    pub fn flag_suspicious(&mut self, code: i32, message: &str) {
        debug!(functor = %self.node.label(), code, message, "Point flagged as suspicious");
        self.suspicions.push(Suspicion {
            functor: self.node.label(),
            code,
            message: message.to_string(),
        });
    }
}
