use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One point of the scanned parameter space: values keyed by model, then by parameter name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterPoint {
    id: u64,
    values: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ParameterPoint {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, model: &str, parameter: &str, value: f64) -> Self {
        self.set(model, parameter, value);
        self
    }

    pub fn set(&mut self, model: &str, parameter: &str, value: f64) {
        self.values
            .entry(model.to_string())
            .or_default()
            .insert(parameter.to_string(), value);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn get(&self, model: &str, parameter: &str) -> Option<f64> {
        self.values
            .get(model)
            .and_then(|params| params.get(parameter))
            .copied()
    }

    pub fn model_parameters(&self, model: &str) -> Option<&BTreeMap<String, f64>> {
        self.values.get(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Flattened `model::parameter` pairs, used when printing a point.
    pub fn flattened(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .flat_map(|(model, params)| {
                params
                    .iter()
                    .map(move |(name, value)| (format!("{model}::{name}"), *value))
            })
            .collect()
    }
}
