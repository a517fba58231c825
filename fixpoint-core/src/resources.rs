//! Buffers observed and desired external objects between control functions
//! and the patch engine.
//!
//! Control functions use the cache to avoid duplicate reads of the external
//! API within one reconciliation, to compose several independent patches onto
//! the same logical object before a single external write, and to signal to
//! the patch engine exactly which objects changed this cycle.

use ahash::AHashMap;

/// One tracked external object of kind `K`.
///
/// `value` is the desired working copy; `original` is the last representation
/// observed from the external system and is the base for the two-way merge
/// diff submitted by the patch engine.
#[derive(Clone, Debug)]
pub struct ResourceCacheEntry<K> {
    name: Option<String>,
    value: K,
    original: K,
    patched: bool,
}

impl<K: Clone> ResourceCacheEntry<K> {
    /// Create an entry for an object observed from (or acknowledged by) the
    /// external system under `name`, or desired-but-not-yet-created when
    /// `name` is `None`.
    pub fn new(name: Option<String>, value: K) -> Self {
        Self {
            name,
            original: value.clone(),
            value,
            patched: false,
        }
    }

    /// Create an entry for a freshly synthesized object that does not exist
    /// upstream yet. The patch engine will create it and record the
    /// server-assigned name.
    pub fn desired(value: K) -> Self {
        Self::new(None, value)
    }

    /// The upstream name, or `None` while the object has not been created.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The current working copy.
    #[must_use]
    pub fn value(&self) -> &K {
        &self.value
    }

    /// The last value observed from the external system.
    #[must_use]
    pub fn original(&self) -> &K {
        &self.original
    }

    /// Apply a patch function to the working copy.
    ///
    /// The function receives the current value and must return a new value;
    /// it cannot mutate the stored one in place. Marks the entry as patched
    /// even if the returned value happens to be identical.
    pub fn apply_patch<F>(&mut self, pf: F)
    where
        F: FnOnce(&K) -> K,
    {
        self.value = pf(&self.value);
        self.patched = true;
    }

    /// Whether a patch has been applied since the entry was last synced.
    #[must_use]
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    /// Clear the patched marker without touching the value.
    pub fn reset_patched(&mut self) {
        self.patched = false;
    }
}

/// Keyed store of [`ResourceCacheEntry`] values for a single resource kind.
///
/// There is no internal concurrency control; the cache is owned by the
/// per-instance context and accessed from a single logical task.
#[derive(Debug)]
pub struct ResourceCache<K> {
    entries: AHashMap<String, ResourceCacheEntry<K>>,
}

impl<K> Default for ResourceCache<K> {
    fn default() -> Self {
        Self {
            entries: AHashMap::new(),
        }
    }
}

impl<K> ResourceCache<K> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ResourceCacheEntry<K>> {
        self.entries.get(key)
    }

    /// Mutable variant of [`ResourceCache::get`].
    pub fn get_mut(&mut self, key: &str) -> Option<&mut ResourceCacheEntry<K>> {
        self.entries.get_mut(key)
    }

    /// Store `entry` under `key`, replacing any previous entry wholesale.
    pub fn set(&mut self, key: impl Into<String>, entry: ResourceCacheEntry<K>) {
        self.entries.insert(key.into(), entry);
    }

    /// Evict the entry stored under `key`, forcing a re-sync next cycle.
    pub fn remove(&mut self, key: &str) -> Option<ResourceCacheEntry<K>> {
        self.entries.remove(key)
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache tracks no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, entry)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResourceCacheEntry<K>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
