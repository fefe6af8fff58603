//! Medium registry (C11) — named lookup of long-lived objects.
//!
//! The RTSP control plane needs exactly one thing from this module: given a
//! name (a stream path, a track, anything with a stable identity), find the
//! live object behind it, or learn that none exists. [`MediumRegistry`] is
//! that lookup table, generalized so [`crate::mount::MountRegistry`] can be
//! built on top of it instead of re-deriving its own `HashMap` bookkeeping.
//!
//! Invariant: every entry inserted under a name is reachable by that name
//! until [`MediumRegistry::close`] removes it; closing a name removes at
//! most one entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Thread-safe name → object table.
///
/// Cloning a `MediumRegistry` clones the handle, not the table — all clones
/// observe the same entries, mirroring the process-wide registry the
/// original server keeps, scoped instead to one server instance.
pub struct MediumRegistry<T> {
    entries: Arc<RwLock<HashMap<String, Arc<T>>>>,
}

impl<T> MediumRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert `value` under `name`, replacing and returning whatever was
    /// previously registered there.
    pub fn insert(&self, name: &str, value: T) -> Arc<T> {
        let handle = Arc::new(value);
        self.entries.write().insert(name.to_string(), handle.clone());
        handle
    }

    /// Look up an entry by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().get(name).cloned()
    }

    /// Remove and return the entry registered under `name`, if any.
    ///
    /// This is the only way an entry leaves the table — the Medium
    /// lifecycle invariant (reachable by name until closed) is enforced by
    /// there being no other removal path.
    pub fn close(&self, name: &str) -> Option<Arc<T>> {
        self.entries.write().remove(name)
    }

    /// Names of every entry currently registered.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T> Clone for MediumRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for MediumRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let reg: MediumRegistry<u32> = MediumRegistry::new();
        reg.insert("a", 1);
        assert_eq!(*reg.get("a").unwrap(), 1);
        assert!(reg.get("b").is_none());
    }

    #[test]
    fn close_removes_exactly_one() {
        let reg: MediumRegistry<u32> = MediumRegistry::new();
        reg.insert("a", 1);
        reg.insert("b", 2);
        assert_eq!(reg.len(), 2);

        let closed = reg.close("a");
        assert_eq!(closed.map(|v| *v), Some(1));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("a").is_none());
        assert!(reg.get("b").is_some());
    }

    #[test]
    fn close_unknown_name_is_noop() {
        let reg: MediumRegistry<u32> = MediumRegistry::new();
        reg.insert("a", 1);
        assert!(reg.close("nonexistent").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn insert_replaces_existing() {
        let reg: MediumRegistry<u32> = MediumRegistry::new();
        reg.insert("a", 1);
        reg.insert("a", 2);
        assert_eq!(reg.len(), 1);
        assert_eq!(*reg.get("a").unwrap(), 2);
    }

    #[test]
    fn clone_shares_the_same_table() {
        let reg: MediumRegistry<u32> = MediumRegistry::new();
        let clone = reg.clone();
        reg.insert("a", 1);
        assert_eq!(*clone.get("a").unwrap(), 1);
    }
}
