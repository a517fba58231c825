//! Last-known facts about child resources, projected into the custom
//! resource status by the host.

use ahash::AHashMap;

/// String key/value map written by control functions and the patch engine,
/// read only for status projection.
///
/// The dirty bit is set only when a value actually changes, so re-recording
/// the same fact every cycle does not force a status update.
#[derive(Debug, Default)]
pub struct StatusMap {
    values: AHashMap<String, String>,
    changed: bool,
}

impl StatusMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fact. Marks the map changed only if the value differs.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.values.get(&key) != Some(&value) {
            self.values.insert(key, value);
            self.changed = true;
        }
    }

    /// Look up a recorded fact.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Forget a recorded fact. Returns `true` if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.values.remove(key).is_some();
        if removed {
            self.changed = true;
        }
        removed
    }

    /// Whether any fact changed since the last [`StatusMap::reset_changed`].
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Clear the dirty bit after the status has been projected.
    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    /// Iterate over `(key, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::StatusMap;

    #[test]
    fn set_marks_changed_only_on_difference() {
        let mut status = StatusMap::new();
        status.set("serviceName", "app-svc");
        assert!(status.is_changed());
        status.reset_changed();
        status.set("serviceName", "app-svc");
        assert!(!status.is_changed());
        status.set("serviceName", "app-svc-2");
        assert!(status.is_changed());
        assert_eq!(status.get("serviceName"), Some("app-svc-2"));
    }

    #[test]
    fn remove_forgets_and_dirties() {
        let mut status = StatusMap::new();
        status.set("host", "example.com");
        status.reset_changed();
        assert!(status.remove("host"));
        assert!(status.is_changed());
        assert_eq!(status.get("host"), None);
        assert!(!status.remove("host"));
    }
}
