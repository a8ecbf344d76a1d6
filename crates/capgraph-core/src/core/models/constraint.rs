use super::model::ModelRegistry;
use std::collections::{BTreeMap, BTreeSet};

/// Which models a functor or backend function may be used with.
///
/// An empty allow list means "any model". Allowed and denied models are inherited by
/// descendants unless the constraint is built with [`ModelConstraint::exactly`]. Combinations
/// name groups that must all be represented among the active models at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConstraint {
    allowed: BTreeSet<String>,
    denied: BTreeSet<String>,
    groups: BTreeMap<String, BTreeSet<String>>,
    combinations: Vec<Vec<String>>,
    inherited: bool,
}

impl Default for ModelConstraint {
    fn default() -> Self {
        Self::any()
    }
}

impl ModelConstraint {
    pub fn any() -> Self {
        Self {
            allowed: BTreeSet::new(),
            denied: BTreeSet::new(),
            groups: BTreeMap::new(),
            combinations: Vec::new(),
            inherited: true,
        }
    }

    /// Allows exactly this model, without its descendants.
    pub fn exactly(model: &str) -> Self {
        Self {
            allowed: BTreeSet::from([model.to_string()]),
            inherited: false,
            ..Self::any()
        }
    }

    pub fn allow(mut self, model: &str) -> Self {
        self.allowed.insert(model.to_string());
        self
    }

    pub fn deny(mut self, model: &str) -> Self {
        self.denied.insert(model.to_string());
        self
    }

    pub fn group(mut self, name: &str, models: &[&str]) -> Self {
        self.groups.insert(
            name.to_string(),
            models.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn allow_combination(mut self, groups: &[&str]) -> Self {
        self.combinations
            .push(groups.iter().map(|g| g.to_string()).collect());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_empty() && self.denied.is_empty() && self.combinations.is_empty()
    }

    /// True when `model` is named in the allow list itself, not through inheritance.
    pub fn names(&self, model: &str) -> bool {
        self.allowed.contains(model)
    }

    fn lineage<'a>(&self, model: &'a str, registry: &'a ModelRegistry) -> Vec<&'a str> {
        if self.inherited {
            registry.ancestry(model)
        } else {
            vec![model]
        }
    }

    pub fn model_allowed(&self, model: &str, registry: &ModelRegistry) -> bool {
        let lineage = self.lineage(model, registry);
        if lineage.iter().any(|m| self.denied.contains(*m)) {
            return false;
        }
        self.allowed.is_empty() || lineage.iter().any(|m| self.allowed.contains(*m))
    }

    /// Whether the constraint is satisfied by the set of active models.
    ///
    /// Without combinations, a single allowed active model is enough. With combinations,
    /// some combination must have every one of its groups matched by an active model.
    pub fn satisfied_by(&self, active: &[String], registry: &ModelRegistry) -> bool {
        if self.combinations.is_empty() {
            return active.iter().any(|m| self.model_allowed(m, registry));
        }
        self.combinations.iter().any(|combo| {
            combo.iter().all(|group| {
                self.groups.get(group).is_some_and(|members| {
                    active.iter().any(|m| {
                        let lineage = self.lineage(m, registry);
                        !lineage.iter().any(|a| self.denied.contains(*a))
                            && lineage.iter().any(|a| members.contains(*a))
                    })
                })
            })
        })
    }

    /// The number of generations between `model` and the closest ancestor this constraint
    /// names explicitly, or `None` when nothing in the lineage is named.
    pub fn specificity(&self, model: &str, registry: &ModelRegistry) -> Option<usize> {
        self.lineage(model, registry)
            .iter()
            .position(|m| self.allowed.contains(*m))
    }
}
