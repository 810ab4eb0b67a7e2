use std::collections::HashMap;

use super::entity::{Backend, BackendId, BackendKey};

#[derive(Debug, Clone)]
struct TrackedBackend {
    backend: Backend,
    refs: usize,
}

/// Global backend table keyed by backend address.
///
/// Each entry carries the number of services whose backend set contains the
/// address. The count and the record are always updated together: an entry
/// reaching zero references through [`release`](Self::release) is removed in
/// the same call. Entries with zero references only exist between a restore
/// and the following sync sweep.
#[derive(Debug, Clone, Default)]
pub struct BackendTracker {
    entries: HashMap<BackendKey, TrackedBackend>,
}

impl BackendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_of(&self, key: &BackendKey) -> Option<BackendId> {
        self.entries.get(key).map(|e| e.backend.id)
    }

    pub fn get(&self, key: &BackendKey) -> Option<&Backend> {
        self.entries.get(key).map(|e| &e.backend)
    }

    /// Take one reference on `backend`, inserting it if unknown.
    ///
    /// Returns `true` when the count went from zero to one, i.e. the backend
    /// must be (re)written to the map store.
    pub fn retain(&mut self, backend: &Backend) -> bool {
        let entry = self
            .entries
            .entry(backend.key())
            .or_insert_with(|| TrackedBackend {
                backend: backend.clone(),
                refs: 0,
            });
        entry.refs += 1;
        entry.refs == 1
    }

    /// Drop one reference. Returns the record when it was the last one.
    pub fn release(&mut self, key: &BackendKey) -> Option<Backend> {
        let entry = self.entries.get_mut(key)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            return self.entries.remove(key).map(|e| e.backend);
        }
        None
    }

    /// Insert a backend recovered from the map store with no references.
    /// Returns `false` if the address was already known.
    pub fn restore(&mut self, backend: Backend) -> bool {
        if self.entries.contains_key(&backend.key()) {
            return false;
        }
        self.entries.insert(
            backend.key(),
            TrackedBackend {
                backend,
                refs: 0,
            },
        );
        true
    }

    pub fn refcount(&self, key: &BackendKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.refs)
    }

    /// Backends no service references.
    pub fn orphans(&self) -> Vec<Backend> {
        let mut out: Vec<Backend> = self
            .entries
            .values()
            .filter(|e| e.refs == 0)
            .map(|e| e.backend.clone())
            .collect();
        out.sort_by_key(|b| b.id);
        out
    }

    /// Remove an unreferenced entry. Referenced entries are left alone.
    pub fn remove_orphan(&mut self, key: &BackendKey) -> Option<Backend> {
        if self.refcount(key) != 0 {
            return None;
        }
        self.entries.remove(key).map(|e| e.backend)
    }

    pub fn contains_id(&self, id: BackendId) -> bool {
        self.entries.values().any(|e| e.backend.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Backend, usize)> {
        self.entries.values().map(|e| (&e.backend, e.refs))
    }
}
