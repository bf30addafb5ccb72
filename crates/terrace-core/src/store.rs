//! # Keyed Store
//!
//! Session-scoped registry of shared singletons (buffer pool, branch pool,
//! node-specific caches), addressed by type plus a string key.
//!
//! The first `get_or_create` for a key constructs the instance, either with
//! a registered factory or with `Default`; later calls return the same
//! instance. The store has no disposal logic of its own: the session owner
//! takes instances that hold resources back out with `remove` and releases
//! them explicitly.

use crate::FlowError;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

type Factory = Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    ty: TypeId,
    key: String,
}

impl StoreKey {
    fn of<T: Any>(key: &str) -> Self {
        Self {
            ty: TypeId::of::<T>(),
            key: key.to_string(),
        }
    }
}

/// Heterogeneous map from (type, key) to one shared instance.
#[derive(Default)]
pub struct KeyedStore {
    entries: HashMap<StoreKey, Box<dyn Any + Send>>,
    factories: HashMap<StoreKey, Factory>,
}

impl KeyedStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor used the first time `key` is requested as `T`.
    ///
    /// Replaces any earlier factory for the same type and key. Instances that
    /// already exist are left alone.
    pub fn register<T, F>(&mut self, key: impl Into<String>, factory: F)
    where
        T: Any + Send,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let key = StoreKey {
            ty: TypeId::of::<T>(),
            key: key.into(),
        };
        self.factories
            .insert(key, Box::new(move || Box::new(factory()) as Box<dyn Any + Send>));
    }

    /// The instance stored under `key`, constructing it on first use.
    pub fn get_or_create<T>(&mut self, key: &str) -> Result<&mut T, FlowError>
    where
        T: Any + Send + Default,
    {
        let store_key = StoreKey::of::<T>(key);
        if !self.entries.contains_key(&store_key) {
            let instance = match self.factories.get(&store_key) {
                Some(factory) => factory(),
                None => Box::new(T::default()),
            };
            tracing::debug!(key, ty = std::any::type_name::<T>(), "store instance created");
            self.entries.insert(store_key.clone(), instance);
        }
        self.entries
            .get_mut(&store_key)
            .and_then(|instance| instance.downcast_mut::<T>())
            .ok_or_else(|| FlowError::StoreTypeMismatch(key.to_string()))
    }

    /// Like `get_or_create` for types without `Default`; requires a factory.
    pub fn get_or_create_with_factory<T>(&mut self, key: &str) -> Result<&mut T, FlowError>
    where
        T: Any + Send,
    {
        let store_key = StoreKey::of::<T>(key);
        if !self.entries.contains_key(&store_key) {
            let factory = self
                .factories
                .get(&store_key)
                .ok_or_else(|| FlowError::InvalidConfig(format!("no factory for store key '{key}'")))?;
            self.entries.insert(store_key.clone(), factory());
        }
        self.entries
            .get_mut(&store_key)
            .and_then(|instance| instance.downcast_mut::<T>())
            .ok_or_else(|| FlowError::StoreTypeMismatch(key.to_string()))
    }

    /// Shared access to an existing instance.
    #[must_use]
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.entries
            .get(&StoreKey::of::<T>(key))
            .and_then(|instance| instance.downcast_ref::<T>())
    }

    /// Exclusive access to an existing instance.
    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.entries
            .get_mut(&StoreKey::of::<T>(key))
            .and_then(|instance| instance.downcast_mut::<T>())
    }

    /// Whether an instance exists for this type and key.
    #[must_use]
    pub fn contains<T: Any + Send>(&self, key: &str) -> bool {
        self.entries.contains_key(&StoreKey::of::<T>(key))
    }

    /// Take an instance out so its owner can release it.
    pub fn remove<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        self.entries
            .remove(&StoreKey::of::<T>(key))
            .and_then(|instance| instance.downcast::<T>().ok())
            .map(|instance| *instance)
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for KeyedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.entries.keys().map(|k| k.key.as_str()).collect();
        keys.sort_unstable();
        f.debug_struct("KeyedStore")
            .field("keys", &keys)
            .field("factories", &self.factories.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
