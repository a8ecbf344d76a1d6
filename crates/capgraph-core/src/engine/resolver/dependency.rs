use super::Session;
use crate::core::models::ids::FunctorId;
use crate::engine::config::{ModuleRule, ObservableRequest};
use crate::engine::error::{CandidateSummary, Quantity, ResolutionError};
use crate::engine::graph::NodeId;
use crate::engine::registry::functor::{DependencySpec, LoopRequirement};
use tracing::debug;

const OBSERVABLE_REQUEST: &str = "observable request";

impl<'r> Session<'r> {
    pub(super) fn select_observable(
        &self,
        observable: &ObservableRequest,
    ) -> Result<FunctorId, ResolutionError> {
        let quantity = Quantity::new(&observable.capability, observable.type_tag.as_ref());
        let candidates: Vec<FunctorId> = self
            .registries
            .functors
            .lookup(
                &observable.capability,
                observable.type_tag.as_ref(),
                &self.registries.types,
            )
            .into_iter()
            .filter(|&id| {
                let f = self.functor(id);
                observable.function.as_ref().is_none_or(|n| *n == f.function)
                    && observable.module.as_ref().is_none_or(|m| *m == f.origin)
            })
            .collect();
        self.choose(&quantity, OBSERVABLE_REQUEST, candidates, &[])
    }

    pub(super) fn select_dependency(
        &self,
        dependent: FunctorId,
        dep: &DependencySpec,
        targeting: &[&ModuleRule],
    ) -> Result<FunctorId, ResolutionError> {
        let quantity = Quantity::new(&dep.capability, Some(&dep.type_tag));
        let candidates: Vec<FunctorId> = self
            .registries
            .functors
            .lookup(&dep.capability, Some(&dep.type_tag), &self.registries.types)
            .into_iter()
            .filter(|&id| id != dependent)
            .collect();
        self.choose(
            &quantity,
            &self.functor(dependent).label(),
            candidates,
            targeting,
        )
    }

    pub(super) fn activate_loop_manager(
        &mut self,
        nested: FunctorId,
        requirement: &LoopRequirement,
        targeting: &[&ModuleRule],
    ) -> Result<NodeId, ResolutionError> {
        let quantity = Quantity::new(&requirement.capability, requirement.type_tag.as_ref());
        let required_by = self.functor(nested).label();
        let candidates: Vec<FunctorId> = self
            .registries
            .functors
            .lookup(
                &requirement.capability,
                requirement.type_tag.as_ref(),
                &self.registries.types,
            )
            .into_iter()
            .filter(|&id| id != nested)
            .collect();
        let chosen = self.choose(&quantity, &required_by, candidates, targeting)?;
        let manager = self.functor(chosen);
        if !manager.is_loop_manager() {
            return Err(ResolutionError::NotALoopManager {
                manager: manager.label(),
                required_by,
            });
        }
        if self.functor(nested).is_loop_manager() {
            return Err(ResolutionError::NestedLoopManager {
                nested: required_by,
                manager: manager.label(),
            });
        }
        self.activate(chosen)
    }

    /// Narrows `candidates` down to exactly one provider.
    ///
    /// Strong rules and rules on the dependent's dependencies must hold. Candidates must be
    /// usable with the active models. Remaining ties are broken by model specificity and
    /// then by weak rules.
    fn choose(
        &self,
        quantity: &Quantity,
        required_by: &str,
        candidates: Vec<FunctorId>,
        targeting: &[&ModuleRule],
    ) -> Result<FunctorId, ResolutionError> {
        let types = &self.registries.types;
        let models = &self.registries.models;
        let active = &self.request.active_models;
        let summary = |id: FunctorId, status: &str| self.registries.functors.summary(id, status);

        let missing = |disabled: Vec<CandidateSummary>| ResolutionError::MissingProvider {
            quantity: quantity.clone(),
            required_by: required_by.to_string(),
            disabled,
        };

        if candidates.is_empty() {
            return Err(missing(Vec::new()));
        }

        let strong_rules: Vec<&ModuleRule> =
            self.request.rules.iter().filter(|r| !r.weak).collect();
        let (allowed, excluded): (Vec<FunctorId>, Vec<FunctorId>) =
            candidates.into_iter().partition(|&id| {
                let f = self.functor(id);
                strong_rules.iter().all(|r| r.allows(f, types))
            });
        if allowed.is_empty() {
            return Err(missing(
                excluded
                    .into_iter()
                    .map(|id| summary(id, "excluded by rule"))
                    .collect(),
            ));
        }

        let (usable, unusable): (Vec<FunctorId>, Vec<FunctorId>) =
            allowed.into_iter().partition(|&id| {
                let f = self.functor(id);
                f.can_be_used() && f.models.satisfied_by(active, models)
            });
        if usable.is_empty() {
            let model_blocked = unusable
                .iter()
                .all(|&id| !self.functor(id).models.satisfied_by(active, models));
            if model_blocked {
                return Err(ResolutionError::ModelIncompatible {
                    quantity: quantity.clone(),
                    required_by: required_by.to_string(),
                    active_models: active.clone(),
                    candidates: unusable
                        .into_iter()
                        .map(|id| summary(id, "model incompatible"))
                        .collect(),
                });
            }
            return Err(missing(
                unusable
                    .into_iter()
                    .map(|id| {
                        let f = self.functor(id);
                        if f.can_be_used() {
                            summary(id, "model incompatible")
                        } else {
                            summary(id, &f.status.to_string())
                        }
                    })
                    .collect(),
            ));
        }

        let (mut remaining, rejected): (Vec<FunctorId>, Vec<FunctorId>) =
            usable.into_iter().partition(|&id| {
                let f = self.functor(id);
                targeting
                    .iter()
                    .filter(|r| !r.weak)
                    .all(|r| r.dependencies_allow(f, types))
            });
        if remaining.is_empty() {
            return Err(missing(
                rejected
                    .into_iter()
                    .map(|id| summary(id, "excluded by dependency rule"))
                    .collect(),
            ));
        }

        if remaining.len() > 1 && self.request.resolution.prefer_model_specific_functions {
            remaining = self.most_model_specific(remaining);
        }

        if remaining.len() > 1 {
            let preferred: Vec<FunctorId> = remaining
                .iter()
                .copied()
                .filter(|&id| {
                    let f = self.functor(id);
                    self.request
                        .rules
                        .iter()
                        .filter(|r| r.weak)
                        .all(|r| r.allows(f, types))
                        && targeting
                            .iter()
                            .filter(|r| r.weak)
                            .all(|r| r.dependencies_allow(f, types))
                })
                .collect();
            if !preferred.is_empty() {
                remaining = preferred;
            }
        }

        match remaining.as_slice() {
            [single] => {
                debug!(
                    quantity = %quantity,
                    provider = %self.functor(*single).label(),
                    "Resolved quantity"
                );
                Ok(*single)
            }
            _ => Err(ResolutionError::AmbiguousProvider {
                quantity: quantity.clone(),
                required_by: required_by.to_string(),
                candidates: remaining
                    .into_iter()
                    .map(|id| summary(id, "available"))
                    .collect(),
            }),
        }
    }

    /// Keeps the candidates whose model constraint names the closest ancestor of an active
    /// model. Unrestricted candidates count as least specific.
    fn most_model_specific(&self, candidates: Vec<FunctorId>) -> Vec<FunctorId> {
        let models = &self.registries.models;
        let distance = |id: FunctorId| {
            let f = self.functor(id);
            self.request
                .active_models
                .iter()
                .filter_map(|m| f.models.specificity(m, models))
                .min()
                .unwrap_or(usize::MAX)
        };
        let best = candidates.iter().map(|&id| distance(id)).min();
        match best {
            Some(best) if best != usize::MAX => candidates
                .into_iter()
                .filter(|&id| distance(id) == best)
                .collect(),
            _ => candidates,
        }
    }
}
