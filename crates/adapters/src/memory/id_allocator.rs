use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::common::error::DomainError;
use domain::service::entity::{BackendId, BackendKey, L3n4Addr, ServiceId};
use ports::secondary::id_allocator_port::IdAllocatorPort;

pub const MAX_FRONTEND_ID: u32 = u16::MAX as u32;
pub const MAX_BACKEND_ID: u32 = u32::MAX;

/// Bidirectional key <-> ID table over `1..=max`.
///
/// Fresh IDs are handed out round-robin starting after the last one issued,
/// so a released ID is not reused right away.
#[derive(Debug)]
struct IdPool<K> {
    kind: &'static str,
    by_key: HashMap<K, u32>,
    by_id: HashMap<u32, K>,
    last: u32,
    max: u32,
}

impl<K: Copy + Eq + Hash + std::fmt::Display> IdPool<K> {
    fn new(kind: &'static str, max: u32) -> Self {
        Self {
            kind,
            by_key: HashMap::new(),
            by_id: HashMap::new(),
            last: 0,
            max,
        }
    }

    fn acquire(&mut self, key: &K, hint: u32) -> Result<u32, DomainError> {
        if let Some(id) = self.by_key.get(key) {
            return Ok(*id);
        }
        let id = if hint != 0 && hint <= self.max && !self.by_id.contains_key(&hint) {
            hint
        } else {
            self.next_free().ok_or_else(|| {
                DomainError::EngineError(format!("no free {} id for {key}", self.kind))
            })?
        };
        self.by_key.insert(*key, id);
        self.by_id.insert(id, *key);
        self.last = id;
        Ok(id)
    }

    fn next_free(&self) -> Option<u32> {
        if self.by_id.len() as u64 >= u64::from(self.max) {
            return None;
        }
        let start = if self.last >= self.max { 1 } else { self.last + 1 };
        (start..=self.max)
            .chain(1..start)
            .find(|id| !self.by_id.contains_key(id))
    }

    fn restore(&mut self, key: &K, id: u32) -> Result<(), DomainError> {
        if id == 0 || id > self.max {
            return Err(DomainError::InvalidRule(format!(
                "{} id {id} out of range",
                self.kind
            )));
        }
        match (self.by_key.get(key), self.by_id.get(&id)) {
            (Some(held), _) if *held == id => Ok(()),
            (Some(held), _) => Err(DomainError::DuplicateRule(format!(
                "{key} already holds {} id {held}",
                self.kind
            ))),
            (None, Some(owner)) => Err(DomainError::DuplicateRule(format!(
                "{} id {id} already held by {owner}",
                self.kind
            ))),
            (None, None) => {
                self.by_key.insert(*key, id);
                self.by_id.insert(id, *key);
                self.last = self.last.max(id);
                Ok(())
            }
        }
    }

    fn release(&mut self, id: u32) -> bool {
        match self.by_id.remove(&id) {
            Some(key) => {
                self.by_key.remove(&key);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Pools {
    frontends: IdPool<L3n4Addr>,
    backends: IdPool<BackendKey>,
}

/// In-process identifier allocator.
///
/// Clones share one table, which stands in for the allocator's persistent
/// store across registry restarts.
#[derive(Debug, Clone)]
pub struct MemoryIdAllocator {
    pools: Arc<Mutex<Pools>>,
}

impl Default for MemoryIdAllocator {
    fn default() -> Self {
        Self::with_limits(MAX_FRONTEND_ID, MAX_BACKEND_ID)
    }
}

impl MemoryIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_frontend: u32, max_backend: u32) -> Self {
        Self {
            pools: Arc::new(Mutex::new(Pools {
                frontends: IdPool::new("frontend", max_frontend.min(MAX_FRONTEND_ID)),
                backends: IdPool::new("backend", max_backend),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frontend_count(&self) -> usize {
        self.lock().frontends.by_id.len()
    }

    pub fn backend_count(&self) -> usize {
        self.lock().backends.by_id.len()
    }

    pub fn backend_id(&self, key: &BackendKey) -> Option<BackendId> {
        self.lock().backends.by_key.get(key).copied().map(BackendId)
    }
}

impl IdAllocatorPort for MemoryIdAllocator {
    fn acquire_frontend_id(
        &mut self,
        addr: &L3n4Addr,
        hint: ServiceId,
    ) -> Result<ServiceId, DomainError> {
        let id = self.lock().frontends.acquire(addr, u32::from(hint.0))?;
        u16::try_from(id)
            .map(ServiceId)
            .map_err(|_| DomainError::EngineError(format!("frontend id {id} out of range")))
    }

    fn restore_frontend_id(&mut self, addr: &L3n4Addr, id: ServiceId) -> Result<(), DomainError> {
        self.lock().frontends.restore(addr, u32::from(id.0))
    }

    fn delete_frontend_id(&mut self, id: ServiceId) -> Result<(), DomainError> {
        if self.lock().frontends.release(u32::from(id.0)) {
            Ok(())
        } else {
            Err(DomainError::RuleNotFound(format!("frontend id {id}")))
        }
    }

    fn acquire_backend_id(&mut self, key: &BackendKey) -> Result<BackendId, DomainError> {
        self.lock().backends.acquire(key, 0).map(BackendId)
    }

    fn restore_backend_id(&mut self, key: &BackendKey, id: BackendId) -> Result<(), DomainError> {
        self.lock().backends.restore(key, id.0)
    }

    fn delete_backend_id(&mut self, id: BackendId) {
        if !self.lock().backends.release(id.0) {
            tracing::debug!(backend_id = %id, "released unknown backend id");
        }
    }
}
