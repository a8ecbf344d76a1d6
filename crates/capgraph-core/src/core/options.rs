use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("Option '{key}' has an unexpected type: {source}")]
    WrongType {
        key: String,
        source: toml::de::Error,
    },
}

/// Free-form key/value settings attached to a functor by the rules that target it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options(toml::Table);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: toml::Table) -> Self {
        Self(table)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, key: &str, value: impl Into<toml::Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, OptionError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value
                .clone()
                .try_into()
                .map(Some)
                .map_err(|source| OptionError::WrongType {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, OptionError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Adds every key of `other` that is not already set. Earlier rules win.
    pub fn merge_missing(&mut self, other: &Options) {
        for (key, value) in &other.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn table(&self) -> &toml::Table {
        &self.0
    }
}
