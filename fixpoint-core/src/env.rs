//! Ordered composition of container environment variables.
//!
//! Many independent control functions contribute variables for the same
//! container. The cache preserves the order in which variables were first
//! added and only reorders as far as declared dependencies require (a
//! variable that interpolates another must come after it). Variables found on
//! the live object that no control function claims are carried as
//! *unmanaged* and round-trip unchanged, so user additions survive
//! reconciliation; managed variables always win on conflict.

use crate::Fatal;
use ahash::{AHashMap, AHashSet};
use k8s_openapi::api::core::v1::EnvVar;
use tracing::debug;

/// Dependency chains longer than this are treated as cycles.
const MAX_DEPENDENCY_DEPTH: usize = 20;

/// A single environment variable tracked by the [`EnvCache`].
///
/// Wraps a full [`EnvVar`], so both literal values and external references
/// (pod field or secret key selectors) are supported.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvCacheEntry {
    var: EnvVar,
    managed: bool,
    dependencies: Vec<String>,
}

impl EnvCacheEntry {
    /// Wrap an [`EnvVar`] in a cache entry.
    #[must_use]
    pub fn new(var: EnvVar) -> Self {
        Self {
            var,
            managed: true,
            dependencies: Vec::new(),
        }
    }

    /// Entry with a literal string value.
    #[must_use]
    pub fn simple(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(EnvVar {
            name: name.into(),
            value: Some(value.into()),
            ..EnvVar::default()
        })
    }

    /// Declare that this variable must be ordered after `name`.
    /// Duplicate declarations are ignored.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
        self
    }

    /// Variable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.var.name
    }

    /// The underlying variable.
    #[must_use]
    pub fn var(&self) -> &EnvVar {
        &self.var
    }

    /// Names this variable is ordered after, in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Whether a control function claims this variable. Unmanaged entries
    /// were discovered on the live object and round-trip unchanged.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.managed
    }
}

/// Insertion-ordered store of environment variables with dependency-aware
/// sorting and a managed/unmanaged merge protocol.
///
/// Deletion is deferred: [`EnvCache::delete`] leaves a tombstone so the
/// deleted name cannot be resurrected by the live-object merge within the
/// same cycle; tombstones are purged by [`EnvCache::reset_changed`], which the
/// consolidating control function calls after writing the variable list.
#[derive(Debug, Default)]
pub struct EnvCache {
    entries: Vec<EnvCacheEntry>,
    index: AHashMap<String, usize>,
    deleted: AHashSet<String>,
    changed: bool,
}

impl EnvCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live (not tombstoned) entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&EnvCacheEntry> {
        if self.deleted.contains(name) {
            return None;
        }
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Insert or replace an entry under its name. The entry becomes managed,
    /// a tombstone for the name is cleared, and the dirty bit is set.
    /// Replacement preserves the entry's position in insertion order.
    pub fn set(&mut self, mut entry: EnvCacheEntry) {
        entry.managed = true;
        self.deleted.remove(entry.name());
        match self.index.get(entry.name()) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.name().to_owned(), self.entries.len());
                self.entries.push(entry);
            }
        }
        self.changed = true;
    }

    /// Merge a variable discovered on the live object.
    ///
    /// A variable absent from the cache is inserted as unmanaged; one present
    /// but unmanaged is updated in place if its value differs. Managed
    /// entries and tombstoned names are left alone. The dirty bit is only set
    /// when something actually changed, so repeating the merge with the same
    /// live object is a no-op and the loop can stabilize.
    pub fn merge_unmanaged(&mut self, var: &EnvVar) {
        if self.deleted.contains(&var.name) {
            return;
        }
        match self.index.get(&var.name) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                if !entry.managed && entry.var != *var {
                    entry.var = var.clone();
                    self.changed = true;
                }
            }
            None => {
                self.index.insert(var.name.clone(), self.entries.len());
                self.entries.push(EnvCacheEntry {
                    var: var.clone(),
                    managed: false,
                    dependencies: Vec::new(),
                });
                self.changed = true;
            }
        }
    }

    /// Mark the entry with `name` for deletion. Returns `true` if a live
    /// entry existed. The entry stays tombstoned until [`EnvCache::reset_changed`].
    pub fn delete(&mut self, name: &str) -> bool {
        if self.index.contains_key(name) && !self.deleted.contains(name) {
            self.deleted.insert(name.to_owned());
            self.changed = true;
            true
        } else {
            false
        }
    }

    /// Whether `name` was marked for deletion in the current period.
    #[must_use]
    pub fn was_deleted(&self, name: &str) -> bool {
        self.deleted.contains(name)
    }

    /// Whether the cache was mutated since the last [`EnvCache::reset_changed`].
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Purge tombstoned entries and clear the dirty bit. Called by the
    /// consolidating control function after it has written the variable list.
    pub fn reset_changed(&mut self) {
        self.changed = false;
        if self.deleted.is_empty() {
            return;
        }
        let deleted = std::mem::take(&mut self.deleted);
        self.entries.retain(|e| !deleted.contains(e.name()));
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_owned(), i))
            .collect();
    }

    /// Resolve the variables in dependency order.
    ///
    /// Entries are visited in insertion order; each entry's declared
    /// dependencies are appended first, so the result is insertion-order
    /// preserving except where a dependency forces reordering. A missing
    /// dependency is logged and skipped. A chain deeper than 20 entries is
    /// treated as a cycle and therefore fatal.
    pub fn get_sorted(&self) -> Result<Vec<EnvVar>, Fatal> {
        let mut sorted = Vec::with_capacity(self.entries.len());
        let mut visited = AHashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            self.visit(entry, 0, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn visit(
        &self,
        entry: &EnvCacheEntry,
        depth: usize,
        visited: &mut AHashSet<String>,
        sorted: &mut Vec<EnvVar>,
    ) -> Result<(), Fatal> {
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(Fatal::EnvDependencyCycle {
                name: entry.name().to_owned(),
                depth,
            });
        }
        if visited.contains(entry.name()) || self.deleted.contains(entry.name()) {
            return Ok(());
        }
        for dependency in entry.dependencies() {
            if let Some(dep) = self.get(dependency) {
                self.visit(dep, depth + 1, visited, sorted)?;
            } else {
                debug!(entry = entry.name(), dependency = %dependency, "dependency for an entry not found");
            }
        }
        sorted.push(entry.var.clone());
        visited.insert(entry.name().to_owned());
        Ok(())
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.deleted.len()
    }

    /// Whether the cache holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
