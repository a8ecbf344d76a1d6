pub mod backend;
pub mod capability;
pub mod functor;

use self::backend::{BackendEntry, BackendRegistry};
use self::capability::CapabilityRegistry;
use self::functor::{Functor, FunctorStatus};
use crate::core::models::constraint::ModelConstraint;
use crate::core::models::ids::{BackendFnId, FunctorId};
use crate::core::models::model::ModelRegistry;
use crate::core::types::equivalency::TypeEquivalency;
use crate::core::types::value::Value;
use crate::engine::error::RegistryError;
use crate::engine::resolver::Resolver;
use tracing::{debug, warn};

/// Type tag of the functors that publish a model's parameter values.
pub const MODEL_PARAMETERS_TYPE: &str = "ModelParameters";

/// Capability under which the parameters of `model` are published.
pub fn parameters_capability(model: &str) -> String {
    format!("{model}_parameters")
}

/// The full rollcall: models, functors, backend functions and type equivalencies.
///
/// Populated once, single-threaded, before any resolution; read-only afterwards.
#[derive(Debug, Default)]
pub struct Registries {
    pub models: ModelRegistry,
    pub functors: CapabilityRegistry,
    pub backends: BackendRegistry,
    pub types: TypeEquivalency,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a model and registers the functor that publishes its parameters.
    ///
    /// The functor is usable with descendants of the model too; they publish their own
    /// values under the ancestor's capability.
    pub fn declare_model(
        &mut self,
        name: &str,
        parent: Option<&str>,
        parameters: &[&str],
    ) -> Result<FunctorId, RegistryError> {
        self.models.declare(name, parent, parameters)?;
        let model = name.to_string();
        let functor = Functor::builder("Models", &format!("{name}_parameters"))
            .provides(&parameters_capability(name), MODEL_PARAMETERS_TYPE)
            .models(ModelConstraint::any().allow(name))
            .compute(move |ctx, result| {
                *result = Value::Map(ctx.parameters(&model)?.clone());
                Ok(())
            })
            .build()?;
        self.functors.register(functor)
    }

    pub fn register_functor(&mut self, functor: Functor) -> Result<FunctorId, RegistryError> {
        self.functors.register(functor)
    }

    pub fn register_backend(&mut self, entry: BackendEntry) -> Result<BackendFnId, RegistryError> {
        self.backends.register(entry)
    }

    /// Disables every functor with an ungrouped backend requirement that no working
    /// backend function can satisfy. Returns the number of functors disabled.
    pub fn refresh_availability(&mut self) -> usize {
        let unusable: Vec<(FunctorId, String)> = self
            .functors
            .iter()
            .filter_map(|(id, f)| {
                f.backend_reqs
                    .iter()
                    .filter(|req| req.group.is_none())
                    .find(|req| {
                        !self
                            .backends
                            .candidates(&req.tag, &req.signature, &self.types)
                            .into_iter()
                            .filter_map(|b| self.backends.get(b))
                            .any(|e| e.is_working())
                    })
                    .map(|req| (id, format!("no working backend for '{}'", req.tag)))
            })
            .collect();

        let count = unusable.len();
        for (id, reason) in unusable {
            debug!(%reason, "Disabling functor");
            if let Err(e) = self.functors.set_status(id, FunctorStatus::Disabled(reason)) {
                warn!("{e}");
            }
        }
        count
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self)
    }
}
