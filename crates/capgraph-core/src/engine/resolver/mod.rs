//! Turns a [`RunRequest`] into a [`DependencyGraph`].
//!
//! Resolution walks depth-first from each requested observable. For every quantity it
//! selects one provider ([`dependency`]), activates that provider's own loop manager and
//! dependencies first, then binds its backend requirements ([`backend`]). Providers that are
//! already active are shared, and a provider met again while it is still being activated
//! closes a cycle.

mod backend;
mod dependency;

use super::config::{ModuleRule, RunRequest};
use super::error::ResolutionError;
use super::graph::{
    DependencyGraph, EdgeKind, GraphBuilder, GraphNode, NodeId, OutputSpec, ResolvedDependency,
};
use super::registry::Registries;
use super::registry::functor::Functor;
use crate::core::models::ids::FunctorId;
use crate::core::options::Options;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

pub struct Resolver<'r> {
    registries: &'r Registries,
}

impl<'r> Resolver<'r> {
    pub fn new(registries: &'r Registries) -> Self {
        Self { registries }
    }

    #[instrument(skip_all, name = "resolve")]
    pub fn resolve(&self, request: &RunRequest) -> Result<DependencyGraph, ResolutionError> {
        if request.observables.is_empty() {
            return Err(ResolutionError::NothingRequested);
        }
        self.registries
            .models
            .validate_active(&request.active_models)?;
        info!(
            models = ?request.active_models,
            observables = request.observables.len(),
            rules = request.rules.len(),
            "Resolving dependencies"
        );

        let mut session = Session::new(self.registries, request);
        for (capability_id, observable) in request.observables.iter().enumerate() {
            let provider = session.select_observable(observable)?;
            let node = session.activate(provider)?;
            let outputs = &mut session.builder.node_mut(node).outputs;
            outputs.push(OutputSpec {
                label: observable.capability.clone(),
                purpose: observable.purpose.clone(),
                printme: observable.printme,
                capability_id,
            });
        }
        session.report_unused_rules();

        let lineages = request
            .active_models
            .iter()
            .map(|m| {
                self.registries
                    .models
                    .ancestry(m)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        let graph = session.builder.finish(lineages)?;
        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Dependency resolution complete"
        );
        Ok(graph)
    }
}

/// Mutable state of a single resolution.
struct Session<'r> {
    registries: &'r Registries,
    request: &'r RunRequest,
    builder: GraphBuilder,
    active: HashMap<FunctorId, NodeId>,
    stack: Vec<FunctorId>,
    used_rules: Vec<bool>,
}

impl<'r> Session<'r> {
    fn new(registries: &'r Registries, request: &'r RunRequest) -> Self {
        Self {
            registries,
            request,
            builder: GraphBuilder::new(),
            active: HashMap::new(),
            stack: Vec::new(),
            used_rules: vec![false; request.rules.len()],
        }
    }

    fn functor(&self, id: FunctorId) -> &'r Functor {
        &self.registries.functors[id]
    }

    fn rules_targeting(&mut self, functor: &Functor) -> Vec<&'r ModuleRule> {
        let types = &self.registries.types;
        let mut targeting = Vec::new();
        for (i, rule) in self.request.rules.iter().enumerate() {
            if rule.targets(functor, types) {
                self.used_rules[i] = true;
                targeting.push(rule);
            }
        }
        targeting
    }

    fn activate(&mut self, id: FunctorId) -> Result<NodeId, ResolutionError> {
        if let Some(&node) = self.active.get(&id) {
            return Ok(node);
        }
        if let Some(pos) = self.stack.iter().position(|&f| f == id) {
            let mut chain: Vec<String> = self.stack[pos..]
                .iter()
                .map(|&f| self.functor(f).label())
                .collect();
            chain.push(self.functor(id).label());
            return Err(ResolutionError::CyclicDependency { chain });
        }

        let functor = self.functor(id);
        debug!(functor = %functor.label(), capability = %functor.capability, "Activating functor");
        self.stack.push(id);
        let targeting = self.rules_targeting(functor);

        let manager = match &functor.nested_in {
            Some(requirement) => Some(self.activate_loop_manager(id, requirement, &targeting)?),
            None => None,
        };

        let mut dependencies = Vec::with_capacity(functor.dependencies.len());
        for dep in &functor.dependencies {
            let provider = self.select_dependency(id, dep, &targeting)?;
            let node = self.activate(provider)?;
            dependencies.push(ResolvedDependency {
                capability: dep.capability.clone(),
                type_tag: dep.type_tag.clone(),
                node,
            });
        }

        let backends = self.bind_backends(functor, &targeting)?;

        let mut options = Options::new();
        for rule in &targeting {
            options.merge_missing(&rule.options);
        }

        self.stack.pop();
        let node = self.builder.add_node(GraphNode {
            functor: id,
            origin: functor.origin.clone(),
            function: functor.function.clone(),
            capability: functor.capability.clone(),
            type_tag: functor.type_tag.clone(),
            implementation: functor.implementation.clone(),
            dependencies,
            backends,
            loop_manager: manager,
            nested: Vec::new(),
            options,
            outputs: Vec::new(),
        });
        self.active.insert(id, node);

        let dep_nodes: Vec<NodeId> = self
            .builder
            .node(node)
            .dependencies
            .iter()
            .map(|d| d.node)
            .collect();
        for dep in dep_nodes {
            self.builder.add_edge(dep, node, EdgeKind::Dependency);
        }
        if let Some(manager) = manager {
            self.builder.add_edge(manager, node, EdgeKind::LoopManager);
            self.force_outside_dependencies(node, manager);
        }
        Ok(node)
    }

    /// A nested functor runs inside its manager, so anything it reads from outside the loop
    /// must be finished before the manager starts.
    fn force_outside_dependencies(&mut self, node: NodeId, manager: NodeId) {
        let outside: Vec<NodeId> = self
            .builder
            .node(node)
            .dependencies
            .iter()
            .map(|d| d.node)
            .filter(|&dep| dep != manager && self.builder.node(dep).loop_manager != Some(manager))
            .collect();
        for dep in outside {
            debug!(
                dependency = %self.builder.node(dep).label(),
                manager = %self.builder.node(manager).label(),
                "Forcing loop-external dependency onto manager"
            );
            self.builder.add_edge(dep, manager, EdgeKind::Forced);
        }
    }

    fn report_unused_rules(&self) {
        for (i, used) in self.used_rules.iter().enumerate() {
            if !used {
                warn!(
                    rule = i,
                    selector = ?self.request.rules[i].selector,
                    "Rule does not match any activated functor"
                );
            }
        }
    }
}
