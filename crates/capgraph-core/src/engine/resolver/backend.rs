use super::Session;
use crate::core::models::ids::BackendFnId;
use crate::engine::config::{BackendPrecedence, BackendRule, ModuleRule};
use crate::engine::error::{CandidateSummary, ResolutionError};
use crate::engine::registry::backend::{BackendEntry, BackendHandle};
use crate::engine::registry::functor::{BackendReqSpec, Functor};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Backend requirements that are satisfied together: a named group, of which any one
/// member suffices, or a single ungrouped requirement.
struct Unit<'f> {
    name: String,
    reqs: Vec<&'f BackendReqSpec>,
}

struct Candidate<'f> {
    req: &'f BackendReqSpec,
    id: BackendFnId,
}

impl<'r> Session<'r> {
    /// Binds every backend requirement of `functor`.
    ///
    /// Units are solved in rounds. While deferral is allowed, a unit whose choice is still
    /// ambiguous and which shares a force-matching set with an unsolved unit is postponed,
    /// so the partner's choice can narrow it down. A round without progress turns deferral off.
    pub(super) fn bind_backends(
        &self,
        functor: &'r Functor,
        targeting: &[&'r ModuleRule],
    ) -> Result<BTreeMap<String, BackendHandle>, ResolutionError> {
        if functor.backend_reqs.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rules: Vec<&BackendRule> = targeting.iter().flat_map(|r| r.backends.iter()).collect();

        let mut groups: BTreeMap<&str, Vec<&BackendReqSpec>> = BTreeMap::new();
        let mut pending: Vec<Unit<'r>> = Vec::new();
        for req in &functor.backend_reqs {
            match &req.group {
                Some(group) => groups.entry(group.as_str()).or_default().push(req),
                None => pending.push(Unit {
                    name: req.tag.clone(),
                    reqs: vec![req],
                }),
            }
        }
        pending.extend(groups.into_iter().map(|(name, reqs)| Unit {
            name: name.to_string(),
            reqs,
        }));

        let mut chosen: Vec<(&'r BackendReqSpec, BackendFnId)> = Vec::new();
        let mut allow_deferral = true;
        while !pending.is_empty() {
            let mut deferred = Vec::new();
            let before = chosen.len();
            for unit in pending {
                match self.solve_unit(functor, &unit, &rules, &chosen, allow_deferral)? {
                    Some(pick) => chosen.push(pick),
                    None => deferred.push(unit),
                }
            }
            if chosen.len() == before {
                allow_deferral = false;
            }
            pending = deferred;
        }

        let mut bound = BTreeMap::new();
        for (req, id) in chosen {
            if let Some(handle) = self.registries.backends.handle(id, &self.registries.types) {
                debug!(
                    functor = %functor.label(),
                    requirement = %req.tag,
                    function = %handle.entry().label(),
                    "Bound backend requirement"
                );
                bound.insert(req.tag.clone(), handle);
            }
        }
        Ok(bound)
    }

    fn solve_unit(
        &self,
        functor: &Functor,
        unit: &Unit<'r>,
        rules: &[&BackendRule],
        chosen: &[(&'r BackendReqSpec, BackendFnId)],
        allow_deferral: bool,
    ) -> Result<Option<(&'r BackendReqSpec, BackendFnId)>, ResolutionError> {
        let backends = &self.registries.backends;
        let active = &self.request.active_models;
        let models = &self.registries.models;
        let mut rejected: Vec<CandidateSummary> = Vec::new();
        let mut candidates: Vec<Candidate<'r>> = Vec::new();

        for &req in &unit.reqs {
            let applicable: Vec<&&BackendRule> =
                rules.iter().filter(|r| r.applies_to(&req.tag)).collect();
            for id in backends.candidates(&req.tag, &req.signature, &self.registries.types) {
                let Some(entry) = backends.get(id) else {
                    continue;
                };
                let status = if !req.permits(&entry.backend, &entry.version) {
                    Some("not permitted".to_string())
                } else if !applicable.iter().all(|r| r.admits(entry)) {
                    Some("excluded by backend rule".to_string())
                } else if !entry.is_working() {
                    Some(entry.status.to_string())
                } else if !entry.models.satisfied_by(active, models) {
                    Some("model incompatible".to_string())
                } else if !self.force_match_ok(functor, req, entry, chosen) {
                    Some("does not match backend of force-matched partner".to_string())
                } else {
                    None
                };
                match status {
                    Some(status) => rejected.push(entry.summary(&status)),
                    None => candidates.push(Candidate { req, id }),
                }
            }
        }

        let missing = |rejected: Vec<CandidateSummary>| ResolutionError::MissingBackend {
            requirement: unit.name.clone(),
            functor: functor.label(),
            disabled: rejected,
        };
        if candidates.is_empty() {
            return Err(missing(rejected));
        }

        if candidates.len() > 1
            && allow_deferral
            && candidates
                .iter()
                .any(|c| self.has_unsolved_partner(functor, c.req, chosen))
        {
            debug!(unit = %unit.name, "Deferring backend requirement");
            return Ok(None);
        }

        let pins: Vec<&str> = rules
            .iter()
            .filter(|r| unit.reqs.iter().any(|req| r.applies_to(&req.tag)))
            .filter_map(|r| r.version.as_deref())
            .collect();
        candidates = self.apply_version_preferences(candidates, &pins, unit);
        if candidates.is_empty() {
            return Err(missing(rejected));
        }

        if candidates.len() > 1 && self.request.resolution.prefer_model_specific_functions {
            candidates = self.most_model_specific_backends(candidates);
        }

        if candidates.len() == 1 {
            let pick = candidates.remove(0);
            return Ok(Some((pick.req, pick.id)));
        }
        Err(ResolutionError::AmbiguousBackend {
            requirement: unit.name.clone(),
            functor: functor.label(),
            candidates: candidates
                .iter()
                .filter_map(|c| backends.get(c.id))
                .map(|e| e.summary("working"))
                .collect(),
        })
    }

    /// Applies version rules and default versions in the configured precedence.
    /// User pins are hard constraints under [`BackendPrecedence::UserFirst`]; defaults only
    /// ever break ties.
    fn apply_version_preferences(
        &self,
        candidates: Vec<Candidate<'r>>,
        pins: &[&str],
        unit: &Unit<'r>,
    ) -> Vec<Candidate<'r>> {
        let backends = &self.registries.backends;
        let pinned = |c: &Candidate<'_>| {
            backends
                .get(c.id)
                .is_some_and(|e| pins.iter().all(|v| *v == e.version))
        };
        let is_default = |c: &Candidate<'_>| {
            backends
                .get(c.id)
                .is_some_and(|e| backends.default_version(&e.backend) == Some(e.version.as_str()))
        };

        match self.request.resolution.backend_precedence {
            BackendPrecedence::UserFirst => {
                let candidates: Vec<_> = candidates.into_iter().filter(|c| pinned(c)).collect();
                prefer(candidates, is_default)
            }
            BackendPrecedence::DefaultFirst => {
                let candidates = prefer(candidates, is_default);
                if pins.is_empty() {
                    return candidates;
                }
                if candidates.iter().any(|c| pinned(c)) {
                    candidates.into_iter().filter(|c| pinned(c)).collect()
                } else {
                    warn!(
                        requirement = %unit.name,
                        versions = ?pins,
                        "Requested backend version conflicts with the default version; using the default"
                    );
                    candidates
                }
            }
        }
    }

    fn force_match_ok(
        &self,
        functor: &Functor,
        req: &BackendReqSpec,
        entry: &BackendEntry,
        chosen: &[(&'r BackendReqSpec, BackendFnId)],
    ) -> bool {
        functor
            .force_matching
            .iter()
            .filter(|set| req.in_matching_set(set))
            .all(|set| {
                chosen
                    .iter()
                    .filter(|(r, _)| r.in_matching_set(set))
                    .filter_map(|(_, id)| self.registries.backends.get(*id))
                    .all(|partner| {
                        partner.backend == entry.backend && partner.version == entry.version
                    })
            })
    }

    fn has_unsolved_partner(
        &self,
        functor: &Functor,
        req: &BackendReqSpec,
        chosen: &[(&'r BackendReqSpec, BackendFnId)],
    ) -> bool {
        let solved = |other: &BackendReqSpec| {
            chosen.iter().any(|(r, _)| {
                r.tag == other.tag || (other.group.is_some() && r.group == other.group)
            })
        };
        functor
            .force_matching
            .iter()
            .filter(|set| req.in_matching_set(set))
            .any(|set| {
                functor
                    .backend_reqs
                    .iter()
                    .filter(|other| other.tag != req.tag && other.in_matching_set(set))
                    .any(|other| !solved(other))
            })
    }

    fn most_model_specific_backends(&self, candidates: Vec<Candidate<'r>>) -> Vec<Candidate<'r>> {
        let backends = &self.registries.backends;
        let models = &self.registries.models;
        let distance = |c: &Candidate<'_>| {
            backends
                .get(c.id)
                .and_then(|e| {
                    self.request
                        .active_models
                        .iter()
                        .filter_map(|m| e.models.specificity(m, models))
                        .min()
                })
                .unwrap_or(usize::MAX)
        };
        let best = candidates.iter().map(&distance).min().unwrap_or(usize::MAX);
        if best == usize::MAX {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|c| distance(c) == best)
            .collect()
    }
}

/// Keeps the candidates satisfying `pred` when at least one does.
fn prefer<T>(candidates: Vec<T>, pred: impl Fn(&T) -> bool) -> Vec<T> {
    if candidates.len() > 1 && candidates.iter().any(&pred) {
        candidates.into_iter().filter(|c| pred(c)).collect()
    } else {
        candidates
    }
}
