//! Matching of user rules against functors and backend functions.
//!
//! A selector has *condition* fields, which decide whether it speaks about a functor at all,
//! and *constraint* fields, which the functor must then satisfy. When a capability is given,
//! capability and type are the condition and function and module the constraint. Without a
//! capability, the function name is the condition and the module the constraint.

use super::config::{BackendRule, FunctorSelector, ModuleRule};
use super::registry::backend::BackendEntry;
use super::registry::functor::Functor;
use crate::core::types::equivalency::TypeEquivalency;

impl FunctorSelector {
    /// Every set field equals the functor's.
    pub fn matches(&self, f: &Functor, types: &TypeEquivalency) -> bool {
        self.capability.as_ref().is_none_or(|c| *c == f.capability)
            && self
                .type_tag
                .as_ref()
                .is_none_or(|t| types.equivalent(t, &f.type_tag))
            && self.function.as_ref().is_none_or(|n| *n == f.function)
            && self.module.as_ref().is_none_or(|m| *m == f.origin)
    }

    pub fn applies_to(&self, f: &Functor, types: &TypeEquivalency) -> bool {
        match (&self.capability, &self.function) {
            (Some(capability), _) => {
                *capability == f.capability
                    && self
                        .type_tag
                        .as_ref()
                        .is_none_or(|t| types.equivalent(t, &f.type_tag))
            }
            (None, Some(function)) => *function == f.function,
            (None, None) => self.module.as_ref().is_some_and(|m| *m == f.origin),
        }
    }

    /// False only when the selector speaks about `f` and `f` violates it.
    pub fn allows(&self, f: &Functor, types: &TypeEquivalency) -> bool {
        !self.applies_to(f, types) || self.matches(f, types)
    }
}

impl ModuleRule {
    /// Whether this rule's selector picks out `f`, making its dependency, backend and
    /// option constraints apply to `f`.
    pub fn targets(&self, f: &Functor, types: &TypeEquivalency) -> bool {
        self.selector.matches(f, types)
    }

    pub fn allows(&self, f: &Functor, types: &TypeEquivalency) -> bool {
        self.selector.allows(f, types)
    }

    pub fn dependencies_allow(&self, candidate: &Functor, types: &TypeEquivalency) -> bool {
        self.dependencies.iter().all(|d| d.allows(candidate, types))
    }
}

impl BackendRule {
    pub fn applies_to(&self, requirement: &str) -> bool {
        self.capability.as_deref().is_none_or(|c| c == requirement)
    }

    /// Whether `entry` passes the backend and function filters. Versions are pins,
    /// handled during version preference.
    pub fn admits(&self, entry: &BackendEntry) -> bool {
        self.backend.as_deref().is_none_or(|b| b == entry.backend)
            && self.function.as_deref().is_none_or(|f| f == entry.function)
    }
}
