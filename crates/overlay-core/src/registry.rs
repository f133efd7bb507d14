//! Index Registry
//!
//! Keyed collection with one unique key and any number of shared (non-unique)
//! secondary keys over the same entity set.
//!
//! ## Design
//!
//! - Unique key: exact-match lookup, duplicate registration is rejected
//! - Shared keys: enumerate every entity carrying a key value (e.g. all
//!   connections touching a peer)
//! - Ordering: `values()` and `find_all()` yield insertion order
//! - No locking: owned by exactly one router and only touched between
//!   suspension points

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::Hash,
};

use crate::error::RegistryError;

/// An entity that can be stored in an [`IndexRegistry`].
///
/// Keys are derived from the entity and must not change while it is
/// registered.
pub trait Indexed {
    /// Unique key type.
    type Key: Clone + Eq + Hash + fmt::Display;

    /// Shared key type. Distinct secondary indexes are variants of one enum.
    type SharedKey: Clone + Eq + Hash;

    /// The entity's unique key.
    fn key(&self) -> Self::Key;

    /// Every shared key value the entity should be found under.
    fn shared_keys(&self) -> Vec<Self::SharedKey>;
}

/// Registry with a unique index and shared secondary indexes.
pub struct IndexRegistry<T: Indexed> {
    /// Insertion counter, gives a stable order
    next_seq: u64,
    /// Unique index
    entries: HashMap<T::Key, (u64, T)>,
    /// Insertion order
    order: BTreeMap<u64, T::Key>,
    /// Shared indexes, each ordered by insertion
    shared: HashMap<T::SharedKey, BTreeMap<u64, T::Key>>,
}

impl<T: Indexed> IndexRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { next_seq: 0, entries: HashMap::new(), order: BTreeMap::new(), shared: HashMap::new() }
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entity with this unique key is registered.
    pub fn contains(&self, key: &T::Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entity.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateKey` if the unique key is taken. The
    /// registry is left unchanged.
    pub fn register(&mut self, entity: T) -> Result<(), RegistryError> {
        let key = entity.key();
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        for shared in entity.shared_keys() {
            self.shared.entry(shared).or_default().insert(seq, key.clone());
        }
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, entity));

        Ok(())
    }

    /// Remove the entity with this unique key, returning it.
    pub fn unregister(&mut self, key: &T::Key) -> Option<T> {
        let (seq, entity) = self.entries.remove(key)?;
        self.order.remove(&seq);

        for shared in entity.shared_keys() {
            if let Some(index) = self.shared.get_mut(&shared) {
                index.remove(&seq);
                if index.is_empty() {
                    self.shared.remove(&shared);
                }
            }
        }

        Some(entity)
    }

    /// Exact-match lookup by unique key.
    pub fn find(&self, key: &T::Key) -> Option<&T> {
        self.entries.get(key).map(|(_, entity)| entity)
    }

    /// Lookup for an entity the caller knows is present.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::MissingKey` if it is not, which means a routing
    /// invariant was broken.
    pub fn get(&self, key: &T::Key) -> Result<&T, RegistryError> {
        self.find(key).ok_or_else(|| RegistryError::MissingKey(key.to_string()))
    }

    /// Every entity registered under a shared key, in insertion order.
    pub fn find_all(&self, shared: &T::SharedKey) -> Vec<&T> {
        self.shared
            .get(shared)
            .map(|index| index.values().filter_map(|key| self.find(key)).collect())
            .unwrap_or_default()
    }

    /// Every entity, in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.order.values().filter_map(|key| self.find(key))
    }
}

impl<T: Indexed> Default for IndexRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Indexed> fmt::Debug for IndexRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexRegistry")
            .field("len", &self.entries.len())
            .field("shared_keys", &self.shared.len())
            .finish()
    }
}
