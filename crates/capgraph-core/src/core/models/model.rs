use super::params::ParameterPoint;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// The hierarchy of declared models. Each model may name a parent, which makes every
/// functor compatible with the parent usable when the child is active.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDefinition>,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ModelError {
    #[error("Model '{0}' is declared more than once")]
    Duplicate(String),
    #[error("Model '{model}' names unknown parent '{parent}'")]
    UnknownParent { model: String, parent: String },
    #[error("Unknown model '{0}'")]
    UnknownModel(String),
    #[error("No active models were given")]
    NoActiveModels,
    #[error("Parameter point {point_id} is missing parameter '{parameter}' of model '{model}'")]
    MissingParameter {
        point_id: u64,
        model: String,
        parameter: String,
    },
    #[error("Parameter point {point_id} sets '{parameter}', which model '{model}' does not declare")]
    UnknownParameter {
        point_id: u64,
        model: String,
        parameter: String,
    },
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid model hierarchy in '{path}': {source}")]
    Hierarchy { path: String, source: ModelError },
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `[ModelName] parent = "..." parameters = [...]` tables. Parents may appear
    /// after their children in the file.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| ModelLoadError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        let raw: BTreeMap<String, ModelDefinition> =
            toml::from_str(&content).map_err(|e| ModelLoadError::Toml {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;

        let mut registry = Self::new();
        for (name, mut def) in raw {
            def.name = name.clone();
            registry.models.insert(name, def);
        }
        registry
            .check_parents()
            .map_err(|source| ModelLoadError::Hierarchy {
                path: path.to_string_lossy().to_string(),
                source,
            })?;
        Ok(registry)
    }

    fn check_parents(&self) -> Result<(), ModelError> {
        for def in self.models.values() {
            if let Some(parent) = &def.parent {
                if !self.models.contains_key(parent) {
                    return Err(ModelError::UnknownParent {
                        model: def.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn declare(
        &mut self,
        name: &str,
        parent: Option<&str>,
        parameters: &[&str],
    ) -> Result<(), ModelError> {
        if self.models.contains_key(name) {
            return Err(ModelError::Duplicate(name.to_string()));
        }
        if let Some(parent) = parent {
            if !self.models.contains_key(parent) {
                return Err(ModelError::UnknownParent {
                    model: name.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        self.models.insert(
            name.to_string(),
            ModelDefinition {
                name: name.to_string(),
                parent: parent.map(str::to_string),
                parameters: parameters.iter().map(|p| p.to_string()).collect(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelDefinition> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDefinition> {
        self.models.values()
    }

    /// The model itself followed by its parent, grandparent, and so on.
    pub fn ancestry<'a>(&'a self, name: &'a str) -> Vec<&'a str> {
        let mut lineage = Vec::new();
        let mut current = Some(name);
        while let Some(model) = current {
            if lineage.contains(&model) {
                break;
            }
            lineage.push(model);
            current = self
                .models
                .get(model)
                .and_then(|def| def.parent.as_deref());
        }
        lineage
    }

    pub fn descends_from(&self, model: &str, ancestor: &str) -> bool {
        self.ancestry(model).contains(&ancestor)
    }

    pub fn validate_active(&self, active: &[String]) -> Result<(), ModelError> {
        if active.is_empty() {
            return Err(ModelError::NoActiveModels);
        }
        for model in active {
            if !self.contains(model) {
                return Err(ModelError::UnknownModel(model.clone()));
            }
        }
        Ok(())
    }

    /// Checks that a point carries exactly the declared parameters of every active model.
    pub fn validate_point(
        &self,
        point: &ParameterPoint,
        active: &[String],
    ) -> Result<(), ModelError> {
        for model in active {
            let def = self
                .models
                .get(model)
                .ok_or_else(|| ModelError::UnknownModel(model.clone()))?;
            let values = point.model_parameters(model);
            for parameter in &def.parameters {
                if values.is_none_or(|v| !v.contains_key(parameter)) {
                    return Err(ModelError::MissingParameter {
                        point_id: point.id(),
                        model: model.clone(),
                        parameter: parameter.clone(),
                    });
                }
            }
            if let Some(values) = values {
                if let Some(extra) = values.keys().find(|k| !def.parameters.contains(k)) {
                    return Err(ModelError::UnknownParameter {
                        point_id: point.id(),
                        model: model.clone(),
                        parameter: extra.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
