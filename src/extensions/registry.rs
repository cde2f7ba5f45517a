//! Extension registry
//!
//! Named fixtures shared with test units. Every `get` hands out an
//! independent instance: eager values are rebuilt from a serialized snapshot
//! taken at registration, lazy ones are constructed afresh, so concurrent
//! consumers never share mutable state through here. Handles such as
//! `Arc<Mutex<_>>` are copied all the way down, not shared.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Extension lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Extension not required by the calling context: {0}")]
    NotRequired(String),

    #[error("Extension {name} is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Extension {name} cannot be copied: {reason}")]
    Snapshot { name: String, reason: String },
}

type Constructor = Arc<dyn Fn() -> Result<Box<dyn Any + Send>, String> + Send + Sync>;

/// How an extension produces the instance handed to a consumer
#[derive(Clone)]
pub enum Construction {
    /// A serialized snapshot, deserialized on every `get`
    Eager(Constructor),
    /// A factory called on every `get`
    Lazy(Constructor),
}

/// Extension descriptor
#[derive(Clone)]
pub struct Extension {
    name: String,
    construction: Construction,
}

impl Extension {
    /// Snapshot `value` now; every `get` deserializes a fresh deep copy
    pub fn eager<T>(name: impl Into<String>, value: &T) -> Result<Self, ExtensionError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let name = name.into();
        let snapshot = serde_json::to_value(value).map_err(|err| ExtensionError::Snapshot {
            name: name.clone(),
            reason: err.to_string(),
        })?;
        let constructor: Constructor = Arc::new(move || {
            serde_json::from_value::<T>(snapshot.clone())
                .map(|copy| Box::new(copy) as Box<dyn Any + Send>)
                .map_err(|err| err.to_string())
        });
        Ok(Self {
            name,
            construction: Construction::Eager(constructor),
        })
    }

    pub fn lazy<T, F>(name: impl Into<String>, factory: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let constructor: Constructor = Arc::new(move || Ok(Box::new(factory()) as Box<dyn Any + Send>));
        Self {
            name: name.into(),
            construction: Construction::Lazy(constructor),
        }
    }

    /// Lazy extension whose factory receives a copy of `args` on each call
    pub fn lazy_with<T, A, F>(name: impl Into<String>, args: A, factory: F) -> Self
    where
        T: Send + 'static,
        A: Clone + Send + Sync + 'static,
        F: Fn(A) -> T + Send + Sync + 'static,
    {
        Self::lazy(name, move || factory(args.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.construction, Construction::Lazy(_))
    }

    fn instantiate(&self) -> Result<Box<dyn Any + Send>, String> {
        match &self.construction {
            Construction::Eager(constructor) | Construction::Lazy(constructor) => constructor(),
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("lazy", &self.is_lazy())
            .finish()
    }
}

/// Set of extension names an execution context declared
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    pub fn extend(&mut self, other: &Capabilities) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn allows(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Keyed store of extensions for one run
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: HashMap<String, Extension>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a descriptor; a later registration under the same name wins
    pub fn register(&mut self, extension: Extension) -> &mut Self {
        if self.entries.contains_key(extension.name()) {
            debug!("Replacing extension {}", extension.name());
        }
        self.entries.insert(extension.name().to_string(), extension);
        self
    }

    /// Register a value copied into every consumer; fails if it cannot be serialized
    pub fn register_eager<T>(&mut self, name: impl Into<String>, value: T) -> Result<&mut Self, ExtensionError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Ok(self.register(Extension::eager(name, &value)?))
    }

    pub fn register_lazy<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register(Extension::lazy(name, factory))
    }

    pub fn register_lazy_with<T, A, F>(&mut self, name: impl Into<String>, args: A, factory: F) -> &mut Self
    where
        T: Send + 'static,
        A: Clone + Send + Sync + 'static,
        F: Fn(A) -> T + Send + Sync + 'static,
    {
        self.register(Extension::lazy_with(name, args, factory))
    }

    /// Produce an independent instance of `name` for a context that declared
    /// `declared`
    pub fn get<T: Any>(&self, name: &str, declared: &Capabilities) -> Result<T, ExtensionError> {
        if !declared.allows(name) {
            return Err(ExtensionError::NotRequired(name.to_string()));
        }

        let extension = self
            .entries
            .get(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;

        extension
            .instantiate()
            .map_err(|reason| ExtensionError::Snapshot {
                name: name.to_string(),
                reason,
            })?
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| ExtensionError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Check that every declared name is registered
    pub fn validate(&self, declared: &Capabilities) -> Result<(), ExtensionError> {
        match declared.iter().find(|name| !self.entries.contains_key(*name)) {
            Some(missing) => Err(ExtensionError::NotFound(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("ExtensionRegistry").field("names", &names).finish()
    }
}

/// Owns the registry for the duration of one run and empties it on exit,
/// including early returns and unwinding
pub struct RegistryScope {
    registry: Arc<ExtensionRegistry>,
}

impl RegistryScope {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Read-only handle for runners and units
    pub fn registry(&self) -> Arc<ExtensionRegistry> {
        self.registry.clone()
    }
}

impl Drop for RegistryScope {
    fn drop(&mut self) {
        match Arc::get_mut(&mut self.registry) {
            Some(registry) => {
                debug!("Clearing {} extensions", registry.len());
                registry.clear();
            }
            None => debug!("Extension registry still referenced; released with its last handle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Connection {
        dsn: String,
        opened: Mutex<Vec<String>>,
    }

    fn declared(names: &[&str]) -> Capabilities {
        names.iter().copied().collect()
    }

    #[test]
    fn test_lazy_returns_new_instance_each_call() {
        let mut registry = ExtensionRegistry::new();
        registry.register_lazy_with("db", "postgres://test".to_string(), |dsn| {
            Arc::new(Connection {
                dsn,
                opened: Mutex::new(Vec::new()),
            })
        });

        let caps = declared(&["db"]);
        let first: Arc<Connection> = registry.get("db", &caps).unwrap();
        let second: Arc<Connection> = registry.get("db", &caps).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.dsn, second.dsn);

        first.opened.lock().unwrap().push("tx".to_string());
        assert!(second.opened.lock().unwrap().is_empty());
        assert_eq!(second.dsn, "postgres://test");
    }

    #[test]
    fn test_lazy_factory_called_per_get() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = ExtensionRegistry::new();
        registry.register_lazy("counter", move || counter.fetch_add(1, Ordering::SeqCst));

        let caps = declared(&["counter"]);
        let _: usize = registry.get("counter", &caps).unwrap();
        let _: usize = registry.get("counter", &caps).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_eager_returns_deep_copies() {
        let original = vec!["alpha".to_string(), "beta".to_string()];
        let mut registry = ExtensionRegistry::new();
        registry.register_eager("names", original.clone()).unwrap();

        let caps = declared(&["names"]);
        let mut first: Vec<String> = registry.get("names", &caps).unwrap();
        let second: Vec<String> = registry.get("names", &caps).unwrap();

        assert_ne!(first.as_ptr(), second.as_ptr());
        first.push("gamma".to_string());
        assert_eq!(second, original);
        assert_eq!(registry.get::<Vec<String>>("names", &caps).unwrap(), original);
    }

    #[test]
    fn test_eager_handles_are_not_shared() {
        let mut registry = ExtensionRegistry::new();
        registry
            .register_eager("log", Arc::new(Mutex::new(vec!["boot".to_string()])))
            .unwrap();

        let caps = declared(&["log"]);
        let first: Arc<Mutex<Vec<String>>> = registry.get("log", &caps).unwrap();
        let second: Arc<Mutex<Vec<String>>> = registry.get("log", &caps).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        first.lock().unwrap().push("written by first".to_string());
        assert_eq!(*second.lock().unwrap(), vec!["boot"]);

        let third: Arc<Mutex<Vec<String>>> = registry.get("log", &caps).unwrap();
        assert_eq!(third.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_eager_rejects_unserializable_values() {
        let mut values = std::collections::HashMap::new();
        values.insert(vec![1_u8], "key is not a string".to_string());

        let err = ExtensionRegistry::new().register_eager("bad", values).unwrap_err();
        assert!(matches!(err, ExtensionError::Snapshot { ref name, .. } if name == "bad"));
    }

    #[test]
    fn test_not_found_and_not_required() {
        let mut registry = ExtensionRegistry::new();
        registry.register_eager("present", 1_u32).unwrap();

        let err = registry.get::<u32>("missing", &declared(&["missing"])).unwrap_err();
        assert_eq!(err, ExtensionError::NotFound("missing".to_string()));

        let err = registry.get::<u32>("present", &declared(&[])).unwrap_err();
        assert_eq!(err, ExtensionError::NotRequired("present".to_string()));
    }

    #[test]
    fn test_type_mismatch() {
        let mut registry = ExtensionRegistry::new();
        registry.register_eager("port", 8080_u16).unwrap();

        let err = registry.get::<String>("port", &declared(&["port"])).unwrap_err();
        assert!(matches!(err, ExtensionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = ExtensionRegistry::new();
        registry.register_eager("mode", "first".to_string()).unwrap();
        registry.register_lazy("mode", || "second".to_string());

        assert_eq!(registry.len(), 1);
        let mode: String = registry.get("mode", &declared(&["mode"])).unwrap();
        assert_eq!(mode, "second");
    }

    #[test]
    fn test_validate_and_clear() {
        let mut registry = ExtensionRegistry::new();
        registry.register_eager("a", 1_i32).unwrap();

        assert!(registry.validate(&declared(&["a"])).is_ok());
        assert_eq!(
            registry.validate(&declared(&["a", "b"])),
            Err(ExtensionError::NotFound("b".to_string()))
        );

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_scope_releases_factories() {
        let marker = Arc::new(());
        let weak = Arc::downgrade(&marker);

        let mut registry = ExtensionRegistry::new();
        registry.register_lazy("marker", move || marker.clone());

        let scope = RegistryScope::new(registry);
        assert!(scope.registry().contains("marker"));
        drop(scope);

        assert!(weak.upgrade().is_none());
    }
}
