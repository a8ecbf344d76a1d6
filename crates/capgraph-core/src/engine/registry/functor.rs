use super::backend::Signature;
use crate::core::models::constraint::ModelConstraint;
use crate::core::types::value::{TypeTag, Value};
use crate::engine::context::CallContext;
use crate::engine::error::{ComputationError, RegistryError};
use crate::engine::loop_manager::SubsystemPlan;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub type ComputeFn =
    Arc<dyn Fn(&mut CallContext<'_>, &mut Value) -> Result<(), ComputationError> + Send + Sync>;

pub type LoopPlanFn =
    Arc<dyn Fn(&mut CallContext<'_>) -> Result<Vec<SubsystemPlan>, ComputationError> + Send + Sync>;

#[derive(Clone)]
pub enum Implementation {
    /// Writes one result value per call.
    Compute(ComputeFn),
    /// Plans the subsystems whose iterations drive the functors nested in this one.
    LoopManager(LoopPlanFn),
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Compute(_) => f.write_str("Compute(..)"),
            Implementation::LoopManager(_) => f.write_str("LoopManager(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub capability: String,
    pub type_tag: TypeTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReqSpec {
    /// Name the functor uses to call the bound function, and the capability it asks for.
    pub tag: String,
    pub signature: Signature,
    /// Requirements in the same group are satisfied by a single one of them.
    pub group: Option<String>,
    pub tags: BTreeSet<String>,
    /// `(backend, version)` pairs allowed to satisfy this requirement. `None` means any version.
    pub permitted: Vec<(String, Option<String>)>,
}

impl BackendReqSpec {
    pub fn new(tag: &str, signature: Signature) -> Self {
        Self {
            tag: tag.to_string(),
            signature,
            group: None,
            tags: BTreeSet::new(),
            permitted: Vec::new(),
        }
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn permit(mut self, backend: &str, version: Option<&str>) -> Self {
        self.permitted
            .push((backend.to_string(), version.map(str::to_string)));
        self
    }

    /// Whether this requirement is covered by a force-matching set, either by its own name
    /// or by one of its tags.
    pub fn in_matching_set(&self, set: &BTreeSet<String>) -> bool {
        set.contains(&self.tag) || self.tags.iter().any(|t| set.contains(t))
    }

    pub fn permits(&self, backend: &str, version: &str) -> bool {
        self.permitted.is_empty()
            || self
                .permitted
                .iter()
                .any(|(b, v)| b == backend && v.as_deref().is_none_or(|v| v == version))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRequirement {
    pub capability: String,
    pub type_tag: Option<TypeTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctorStatus {
    Available,
    Disabled(String),
}

impl fmt::Display for FunctorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctorStatus::Available => f.write_str("available"),
            FunctorStatus::Disabled(reason) => write!(f, "disabled: {reason}"),
        }
    }
}

/// A module function registered as a provider of one capability.
#[derive(Debug, Clone)]
pub struct Functor {
    pub function: String,
    pub origin: String,
    pub capability: String,
    pub type_tag: TypeTag,
    pub dependencies: Vec<DependencySpec>,
    pub backend_reqs: Vec<BackendReqSpec>,
    /// Sets of requirement names or tags whose bound functions must all come from one backend.
    pub force_matching: Vec<BTreeSet<String>>,
    pub models: ModelConstraint,
    pub nested_in: Option<LoopRequirement>,
    pub implementation: Implementation,
    pub status: FunctorStatus,
}

impl Functor {
    pub fn builder(origin: &str, function: &str) -> FunctorBuilder {
        FunctorBuilder::new(origin, function)
    }

    pub fn label(&self) -> String {
        format!("{}::{}", self.origin, self.function)
    }

    pub fn is_loop_manager(&self) -> bool {
        matches!(self.implementation, Implementation::LoopManager(_))
    }

    pub fn can_be_used(&self) -> bool {
        self.status == FunctorStatus::Available
    }
}

#[derive(Default)]
pub struct FunctorBuilder {
    origin: String,
    function: String,
    capability: Option<(String, TypeTag)>,
    dependencies: Vec<DependencySpec>,
    backend_reqs: Vec<BackendReqSpec>,
    force_matching: Vec<BTreeSet<String>>,
    models: ModelConstraint,
    nested_in: Option<LoopRequirement>,
    implementation: Option<Implementation>,
}

impl FunctorBuilder {
    pub fn new(origin: &str, function: &str) -> Self {
        Self {
            origin: origin.to_string(),
            function: function.to_string(),
            ..Self::default()
        }
    }

    pub fn provides(mut self, capability: &str, type_tag: &str) -> Self {
        self.capability = Some((capability.to_string(), TypeTag::new(type_tag)));
        self
    }

    pub fn depends_on(mut self, capability: &str, type_tag: &str) -> Self {
        self.dependencies.push(DependencySpec {
            capability: capability.to_string(),
            type_tag: TypeTag::new(type_tag),
        });
        self
    }

    pub fn backend_req(mut self, req: BackendReqSpec) -> Self {
        self.backend_reqs.push(req);
        self
    }

    pub fn force_matching_backends(mut self, tags: &[&str]) -> Self {
        self.force_matching
            .push(tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn models(mut self, models: ModelConstraint) -> Self {
        self.models = models;
        self
    }

    pub fn allow_model(mut self, model: &str) -> Self {
        self.models = self.models.allow(model);
        self
    }

    pub fn nested_in(mut self, loop_capability: &str) -> Self {
        self.nested_in = Some(LoopRequirement {
            capability: loop_capability.to_string(),
            type_tag: None,
        });
        self
    }

    pub fn compute<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &mut Value) -> Result<(), ComputationError>
            + Send
            + Sync
            + 'static,
    {
        self.implementation = Some(Implementation::Compute(Arc::new(f)));
        self
    }

    pub fn loop_manager<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> Result<Vec<SubsystemPlan>, ComputationError>
            + Send
            + Sync
            + 'static,
    {
        self.implementation = Some(Implementation::LoopManager(Arc::new(f)));
        self
    }

    pub fn build(self) -> Result<Functor, RegistryError> {
        let (capability, type_tag) = self
            .capability
            .ok_or(RegistryError::MissingParameter("capability"))?;
        let implementation = self
            .implementation
            .ok_or(RegistryError::MissingParameter("implementation"))?;
        Ok(Functor {
            function: self.function,
            origin: self.origin,
            capability,
            type_tag,
            dependencies: self.dependencies,
            backend_reqs: self.backend_reqs,
            force_matching: self.force_matching,
            models: self.models,
            nested_in: self.nested_in,
            implementation,
            status: FunctorStatus::Available,
        })
    }
}
