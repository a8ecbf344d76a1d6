use crate::core::models::constraint::ModelConstraint;
use crate::core::models::ids::BackendFnId;
use crate::core::types::equivalency::TypeEquivalency;
use crate::core::types::value::{TypeTag, Value};
use crate::engine::error::{BackendCallError, CandidateSummary, RegistryError};
use itertools::Itertools;
use parking_lot::{Mutex, MutexGuard};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub args: Vec<TypeTag>,
    pub returns: TypeTag,
}

impl Signature {
    pub fn new(args: &[&str], returns: &str) -> Self {
        Self {
            args: args.iter().map(|a| TypeTag::new(*a)).collect(),
            returns: TypeTag::new(returns),
        }
    }

    pub fn matches(&self, other: &Signature, types: &TypeEquivalency) -> bool {
        self.args.len() == other.args.len()
            && types.equivalent(&self.returns, &other.returns)
            && self
                .args
                .iter()
                .zip(&other.args)
                .all(|(a, b)| types.equivalent(a, b))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<&str> = self.args.iter().map(TypeTag::as_str).collect();
        write!(f, "({}) -> {}", args.join(", "), self.returns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Working,
    /// The shared library could not be found at load time.
    Missing,
    /// Loaded, but the symbol for this function is absent.
    Broken,
    Disabled,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Working => "working",
            BackendStatus::Missing => "backend missing",
            BackendStatus::Broken => "function broken",
            BackendStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

pub type BackendFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// One function exported by one version of an external backend library.
#[derive(Clone)]
pub struct BackendEntry {
    pub backend: String,
    pub version: String,
    pub capability: String,
    pub function: String,
    pub signature: Signature,
    pub status: BackendStatus,
    pub models: ModelConstraint,
    /// Functions that are not thread-safe are serialized through a named lock.
    pub lock: Option<String>,
    callable: Option<BackendFn>,
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("backend", &self.backend)
            .field("version", &self.version)
            .field("capability", &self.capability)
            .field("function", &self.function)
            .field("signature", &self.signature)
            .field("status", &self.status)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl BackendEntry {
    pub fn new(
        backend: &str,
        version: &str,
        capability: &str,
        function: &str,
        signature: Signature,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            version: version.to_string(),
            capability: capability.to_string(),
            function: function.to_string(),
            signature,
            status: BackendStatus::Missing,
            models: ModelConstraint::any(),
            lock: None,
            callable: None,
        }
    }

    /// Attaches the function body and marks the entry as working.
    pub fn with_callable<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.callable = Some(Arc::new(f));
        self.status = BackendStatus::Working;
        self
    }

    pub fn with_status(mut self, status: BackendStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_models(mut self, models: ModelConstraint) -> Self {
        self.models = models;
        self
    }

    pub fn not_thread_safe(mut self, lock: &str) -> Self {
        self.lock = Some(lock.to_string());
        self
    }

    pub fn is_working(&self) -> bool {
        self.status == BackendStatus::Working && self.callable.is_some()
    }

    pub fn label(&self) -> String {
        format!("{} v{}::{}", self.backend, self.version, self.function)
    }

    pub(crate) fn summary(&self, status: &str) -> CandidateSummary {
        CandidateSummary {
            origin: format!("{} v{}", self.backend, self.version),
            function: self.function.clone(),
            capability: self.capability.clone(),
            type_tag: self.signature.to_string(),
            status: status.to_string(),
        }
    }
}

/// Process-wide table of mutexes keyed by name, shared by every handle bound to a
/// non-thread-safe backend function.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A typed binding from a functor's backend requirement to one registered function.
#[derive(Clone)]
pub struct BackendHandle {
    id: BackendFnId,
    entry: Arc<BackendEntry>,
    lock: Option<Arc<Mutex<()>>>,
    arg_kinds: Arc<[ArgKind]>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("function", &self.entry.label())
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl BackendHandle {
    pub fn id(&self) -> BackendFnId {
        self.id
    }

    pub fn entry(&self) -> &BackendEntry {
        &self.entry
    }

    /// Calls the bound function after checking the argument count and numeric argument kinds.
    /// Holds the function's named lock for the duration of the call, if it has one.
    pub fn call(&self, args: &[Value]) -> Result<Value, BackendCallError> {
        let entry = &*self.entry;
        let callable = match (&entry.callable, entry.status) {
            (Some(f), BackendStatus::Working) => f,
            _ => {
                return Err(BackendCallError::Unavailable {
                    backend: entry.backend.clone(),
                    version: entry.version.clone(),
                    function: entry.function.clone(),
                    status: entry.status.to_string(),
                });
            }
        };

        if args.len() != entry.signature.args.len() {
            return Err(BackendCallError::Arity {
                function: entry.function.clone(),
                expected: entry.signature.args.len(),
                found: args.len(),
            });
        }
        let declared = entry.signature.args.iter().zip(self.arg_kinds.iter());
        for (index, (arg, (expected, kind))) in args.iter().zip(declared).enumerate() {
            if !kind.admits(arg) {
                return Err(BackendCallError::ArgumentType {
                    function: entry.function.clone(),
                    index,
                    expected: expected.to_string(),
                    found: arg.kind(),
                });
            }
        }

        let _guard: Option<MutexGuard<'_, ()>> = self.lock.as_ref().map(|l| l.lock());
        trace!(function = %entry.label(), "Calling backend function");
        callable(args).map_err(|message| BackendCallError::Failed {
            function: entry.function.clone(),
            message,
        })
    }

    pub fn call_f64(&self, args: &[f64]) -> Result<f64, BackendCallError> {
        let values: Vec<Value> = args.iter().map(|&v| Value::Float(v)).collect();
        let result = self.call(&values)?;
        result.as_f64().ok_or_else(|| BackendCallError::Failed {
            function: self.entry.function.clone(),
            message: format!("returned a {} value where a number was expected", result.kind()),
        })
    }
}

/// Value kind a declared argument type is checked against before a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Number,
    Integer,
    Boolean,
    Unchecked,
}

impl ArgKind {
    fn of(tag: &TypeTag, types: &TypeEquivalency) -> Self {
        let tag = tag.as_str();
        if types.equivalent_names(tag, "double") {
            ArgKind::Number
        } else if types.equivalent_names(tag, "int") {
            ArgKind::Integer
        } else if types.equivalent_names(tag, "bool") {
            ArgKind::Boolean
        } else {
            ArgKind::Unchecked
        }
    }

    fn admits(self, value: &Value) -> bool {
        match self {
            ArgKind::Number => matches!(value, Value::Float(_) | Value::Int(_)),
            ArgKind::Integer => matches!(value, Value::Int(_)),
            ArgKind::Boolean => matches!(value, Value::Bool(_)),
            ArgKind::Unchecked => true,
        }
    }
}

/// Every backend function known to the process, plus each backend's default version.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    entries: SlotMap<BackendFnId, Arc<BackendEntry>>,
    order: Vec<BackendFnId>,
    defaults: HashMap<String, String>,
    locks: Arc<NamedLocks>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: BackendEntry) -> Result<BackendFnId, RegistryError> {
        let duplicate = self.order.iter().any(|&id| {
            let e = &self.entries[id];
            e.backend == entry.backend
                && e.version == entry.version
                && e.capability == entry.capability
                && e.function == entry.function
        });
        if duplicate {
            return Err(RegistryError::DuplicateBackend {
                backend: entry.backend,
                version: entry.version,
                capability: entry.capability,
                function: entry.function,
            });
        }
        let id = self.entries.insert(Arc::new(entry));
        self.order.push(id);
        Ok(id)
    }

    pub fn set_default_version(&mut self, backend: &str, version: &str) {
        self.defaults
            .insert(backend.to_string(), version.to_string());
    }

    pub fn default_version(&self, backend: &str) -> Option<&str> {
        self.defaults.get(backend).map(String::as_str)
    }

    pub fn get(&self, id: BackendFnId) -> Option<&BackendEntry> {
        self.entries.get(id).map(|e| &**e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackendFnId, &BackendEntry)> {
        self.order.iter().map(|&id| (id, &*self.entries[id]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn locks(&self) -> &NamedLocks {
        &self.locks
    }

    /// All registered functions for `capability` whose signature matches, in registration order.
    pub fn candidates(
        &self,
        capability: &str,
        signature: &Signature,
        types: &TypeEquivalency,
    ) -> Vec<BackendFnId> {
        self.iter()
            .filter(|(_, e)| e.capability == capability && e.signature.matches(signature, types))
            .map(|(id, _)| id)
            .collect()
    }

    /// Finds a function by backend, version and capability. A missing version selects the
    /// backend's default version.
    pub fn lookup(
        &self,
        backend: &str,
        version: Option<&str>,
        capability: &str,
    ) -> Result<BackendFnId, RegistryError> {
        let version = version.or_else(|| self.default_version(backend));
        self.iter()
            .find(|(_, e)| {
                e.backend == backend
                    && e.capability == capability
                    && version.is_none_or(|v| e.version == v)
            })
            .map(|(id, _)| id)
            .ok_or_else(|| RegistryError::BackendNotFound {
                backend: backend.to_string(),
                version: version.unwrap_or("any").to_string(),
                capability: capability.to_string(),
            })
    }

    /// Binds function `id`. Argument types are classified through `types`, so aliases of
    /// `double`, `int` and `bool` get the same kind check as the names themselves.
    pub fn handle(&self, id: BackendFnId, types: &TypeEquivalency) -> Option<BackendHandle> {
        let entry = self.entries.get(id)?.clone();
        let lock = entry.lock.as_deref().map(|name| self.locks.get(name));
        let arg_kinds = entry
            .signature
            .args
            .iter()
            .map(|tag| ArgKind::of(tag, types))
            .collect();
        Some(BackendHandle {
            id,
            entry,
            lock,
            arg_kinds,
        })
    }

    /// Status table of every registered backend function. Default versions are starred.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{:<20} {:<10} {:<24} {:<24} {:<28} {}\n",
            "BACKEND", "VERSION", "FUNCTION", "CAPABILITY", "SIGNATURE", "STATUS"
        );
        for (_, e) in self.iter() {
            let version = if self.default_version(&e.backend) == Some(e.version.as_str()) {
                format!("{}*", e.version)
            } else {
                e.version.clone()
            };
            let status = match &e.lock {
                Some(lock) => format!("{} (lock: {lock})", e.status),
                None => e.status.to_string(),
            };
            out.push_str(&format!(
                "{:<20} {:<10} {:<24} {:<24} {:<28} {}\n",
                e.backend,
                version,
                e.function,
                e.capability,
                e.signature.to_string(),
                status
            ));
        }
        out
    }

    pub fn versions_of(&self, backend: &str) -> Vec<&str> {
        self.iter()
            .filter(|(_, e)| e.backend == backend)
            .map(|(_, e)| e.version.as_str())
            .unique()
            .collect()
    }
}
