use super::value::TypeTag;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;

/// Classes of type names that must be treated as the same type when matching
/// a dependency or backend signature against a provider.
#[derive(Debug, Clone)]
pub struct TypeEquivalency {
    classes: Vec<BTreeSet<String>>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EquivalencyFile {
    equivalency_classes: Vec<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum EquivalencyLoadError {
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
}

impl Default for TypeEquivalency {
    fn default() -> Self {
        let mut table = Self::empty();
        table.add_class(["double", "f64", "float"]);
        table.add_class(["int", "i64", "integer"]);
        table.add_class(["str", "string", "std::string"]);
        table.add_class(["map_str_dbl", "std::map<std::string,double>"]);
        table
    }
}

impl TypeEquivalency {
    pub fn empty() -> Self {
        Self {
            classes: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, EquivalencyLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| EquivalencyLoadError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        let file: EquivalencyFile =
            toml::from_str(&content).map_err(|e| EquivalencyLoadError::Toml {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;
        let mut table = Self::default();
        for class in file.equivalency_classes {
            table.add_class(class);
        }
        Ok(table)
    }

    /// Declares the given names equivalent. Classes sharing a member are merged.
    pub fn add_class<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return;
        }

        let touched: BTreeSet<usize> = names
            .iter()
            .filter_map(|n| self.index.get(n).copied())
            .collect();

        let mut merged = names;
        for &idx in touched.iter().rev() {
            merged.extend(self.classes.remove(idx));
        }
        self.classes.push(merged);
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (idx, class) in self.classes.iter().enumerate() {
            for name in class {
                self.index.insert(name.clone(), idx);
            }
        }
    }

    pub fn equivalent(&self, a: &TypeTag, b: &TypeTag) -> bool {
        self.equivalent_names(a.as_str(), b.as_str())
    }

    pub fn equivalent_names(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        match (self.index.get(a), self.index.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn class_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.index.get(name).map(|&idx| &self.classes[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn identical_names_are_always_equivalent() {
        let table = TypeEquivalency::empty();
        assert!(table.equivalent_names("MyType", "MyType"));
        assert!(!table.equivalent_names("MyType", "Other"));
    }

    #[test]
    fn default_table_matches_common_spellings() {
        let table = TypeEquivalency::default();
        assert!(table.equivalent(&TypeTag::new("double"), &TypeTag::new("f64")));
        assert!(!table.equivalent(&TypeTag::new("double"), &TypeTag::new("int")));
    }

    #[test]
    fn overlapping_classes_are_merged() {
        let mut table = TypeEquivalency::empty();
        table.add_class(["a", "b"]);
        table.add_class(["c", "d"]);
        table.add_class(["b", "c"]);
        assert!(table.equivalent_names("a", "d"));
        assert_eq!(table.class_of("a").map(|c| c.len()), Some(4));
    }

    #[test]
    fn load_extends_default_classes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"equivalency_classes = [["Spectrum", "SubSpectrum"], ["double", "real"]]"#
        )
        .unwrap();

        let table = TypeEquivalency::load(file.path()).unwrap();
        assert!(table.equivalent_names("Spectrum", "SubSpectrum"));
        assert!(table.equivalent_names("real", "f64"));
    }

    #[test]
    fn load_fails_for_missing_file() {
        let result = TypeEquivalency::load(Path::new("/nonexistent/types.toml"));
        assert!(matches!(result, Err(EquivalencyLoadError::Io { .. })));
    }
}
