use super::functor::{Functor, FunctorStatus};
use crate::core::models::ids::FunctorId;
use crate::core::types::equivalency::TypeEquivalency;
use crate::core::types::value::TypeTag;
use crate::engine::error::{CandidateSummary, RegistryError};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::ops::Index;

/// Every functor known to the process, indexed by the capability it provides.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    functors: SlotMap<FunctorId, Functor>,
    order: Vec<FunctorId>,
    by_capability: HashMap<String, Vec<FunctorId>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, functor: Functor) -> Result<FunctorId, RegistryError> {
        let clash = self
            .by_capability
            .get(&functor.capability)
            .into_iter()
            .flatten()
            .map(|&id| &self.functors[id])
            .any(|f| {
                f.type_tag == functor.type_tag
                    && f.origin == functor.origin
                    && f.function == functor.function
            });
        if clash {
            return Err(RegistryError::DuplicateFunctor {
                origin: functor.origin,
                function: functor.function,
                capability: functor.capability,
                type_tag: functor.type_tag.to_string(),
            });
        }

        let capability = functor.capability.clone();
        let id = self.functors.insert(functor);
        self.order.push(id);
        self.by_capability.entry(capability).or_default().push(id);
        Ok(id)
    }

    /// Providers of `capability`, in registration order. A `None` type matches any type.
    pub fn lookup(
        &self,
        capability: &str,
        type_tag: Option<&TypeTag>,
        types: &TypeEquivalency,
    ) -> Vec<FunctorId> {
        self.by_capability
            .get(capability)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&id| type_tag.is_none_or(|t| types.equivalent(&self.functors[id].type_tag, t)))
            .collect()
    }

    pub fn get(&self, id: FunctorId) -> Option<&Functor> {
        self.functors.get(id)
    }

    pub fn find(&self, origin: &str, function: &str) -> Option<FunctorId> {
        self.iter()
            .find(|(_, f)| f.origin == origin && f.function == function)
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunctorId, &Functor)> {
        self.order.iter().map(|&id| (id, &self.functors[id]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn set_status(&mut self, id: FunctorId, status: FunctorStatus) -> Result<(), RegistryError> {
        let functor = self
            .functors
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownFunctor(format!("{id:?}")))?;
        functor.status = status;
        Ok(())
    }

    /// Table of every registered functor, in registration order.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{:<16} {:<32} {:<28} {:<18} {}\n",
            "ORIGIN", "FUNCTION", "CAPABILITY", "TYPE", "STATUS"
        );
        for (_, f) in self.iter() {
            let mut status = f.status.to_string();
            if f.is_loop_manager() {
                status.push_str(", loop manager");
            }
            if let Some(lp) = &f.nested_in {
                status.push_str(&format!(", nested in {}", lp.capability));
            }
            out.push_str(&format!(
                "{:<16} {:<32} {:<28} {:<18} {}\n",
                f.origin,
                f.function,
                f.capability,
                f.type_tag.as_str(),
                status
            ));
        }
        out
    }

    pub(crate) fn summary(&self, id: FunctorId, status: &str) -> CandidateSummary {
        let f = &self.functors[id];
        CandidateSummary {
            origin: f.origin.clone(),
            function: f.function.clone(),
            capability: f.capability.clone(),
            type_tag: f.type_tag.to_string(),
            status: status.to_string(),
        }
    }
}

impl Index<FunctorId> for CapabilityRegistry {
    type Output = Functor;

    fn index(&self, id: FunctorId) -> &Functor {
        &self.functors[id]
    }
}
