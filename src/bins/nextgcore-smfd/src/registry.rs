//! Session Registry
//!
//! Owns every live SM context. One table maps the context id to its handle;
//! three indices (SUPI + PSI, context reference, local SEID) map back to the
//! id. Tables and indices change together under the registry lock, which is
//! never held while a context lock is taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::{SessionHandle, SmContext};
use crate::topology::SNssai;

#[derive(Default)]
struct RegistryTables {
    contexts: HashMap<u64, Arc<SessionHandle>>,
    by_supi_psi: HashMap<(String, u8), u64>,
    by_ref: HashMap<String, u64>,
    by_seid: HashMap<u64, u64>,
    seids_of: HashMap<u64, Vec<u64>>,
}

/// Process-wide table of SM contexts
pub struct SessionRegistry {
    inner: RwLock<RegistryTables>,
    next_id: AtomicU64,
    seid_generator: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryTables::default()),
            next_id: AtomicU64::new(1),
            seid_generator: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryTables> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryTables> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and index a new context. An existing entry for the same SUPI
    /// and PSI stays in the owner table; the caller releases it.
    pub fn create(&self, supi: &str, psi: u8, snssai: SNssai, dnn: &str) -> Arc<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(SessionHandle::new(SmContext::new(id, supi, psi, snssai, dnn)));

        let mut tables = self.write();
        tables.by_supi_psi.insert((supi.to_string(), psi), id);
        tables.by_ref.insert(handle.sm_context_ref().to_string(), id);
        tables.contexts.insert(id, handle.clone());

        log::info!(
            "[Added] SM context [{}:{}] (id={}, ref={})",
            supi,
            psi,
            id,
            handle.sm_context_ref()
        );
        handle
    }

    /// Hand out a local SEID and index it to context `id`
    pub fn allocate_seid(&self, id: u64) -> u64 {
        let seid = self.seid_generator.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.write();
        tables.by_seid.insert(seid, id);
        tables.seids_of.entry(id).or_default().push(seid);
        seid
    }

    pub fn find(&self, id: u64) -> Option<Arc<SessionHandle>> {
        self.read().contexts.get(&id).cloned()
    }

    pub fn find_by_ref(&self, sm_context_ref: &str) -> Option<Arc<SessionHandle>> {
        let tables = self.read();
        let id = tables.by_ref.get(sm_context_ref)?;
        tables.contexts.get(id).cloned()
    }

    pub fn find_by_supi_psi(&self, supi: &str, psi: u8) -> Option<Arc<SessionHandle>> {
        let tables = self.read();
        let id = tables.by_supi_psi.get(&(supi.to_string(), psi))?;
        tables.contexts.get(id).cloned()
    }

    pub fn find_by_seid(&self, seid: u64) -> Option<Arc<SessionHandle>> {
        let tables = self.read();
        let id = tables.by_seid.get(&seid)?;
        tables.contexts.get(id).cloned()
    }

    /// Drop a context and every index entry that points at it. The SUPI
    /// index is only cleared when it still refers to this context.
    pub fn remove(&self, id: u64) -> Option<Arc<SessionHandle>> {
        let mut tables = self.write();
        let handle = tables.contexts.remove(&id)?;

        tables.by_supi_psi.retain(|_, v| *v != id);
        tables.by_ref.remove(handle.sm_context_ref());
        for seid in tables.seids_of.remove(&id).unwrap_or_default() {
            tables.by_seid.remove(&seid);
        }

        log::info!("[Removed] SM context (id={}, ref={})", id, handle.sm_context_ref());
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.read().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snssai() -> SNssai {
        SNssai::new(1, Some(0x010203))
    }

    #[test]
    fn test_create_and_lookup() {
        let registry = SessionRegistry::new();
        let handle = registry.create("imsi-001010000000001", 5, snssai(), "internet");
        assert_eq!(registry.len(), 1);

        let by_ref = registry.find_by_ref(handle.sm_context_ref()).unwrap();
        assert_eq!(by_ref.id(), handle.id());
        let by_supi = registry.find_by_supi_psi("imsi-001010000000001", 5).unwrap();
        assert_eq!(by_supi.id(), handle.id());
        assert!(registry.find_by_supi_psi("imsi-001010000000001", 6).is_none());
        assert!(handle.sm_context_ref().starts_with("urn:uuid:"));
    }

    #[test]
    fn test_seid_index() {
        let registry = SessionRegistry::new();
        let handle = registry.create("imsi-1", 1, snssai(), "internet");
        let s1 = registry.allocate_seid(handle.id());
        let s2 = registry.allocate_seid(handle.id());
        assert_ne!(s1, s2);
        assert_eq!(registry.find_by_seid(s1).unwrap().id(), handle.id());
        assert_eq!(registry.find_by_seid(s2).unwrap().id(), handle.id());
        assert!(registry.find_by_seid(9_999).is_none());
    }

    #[test]
    fn test_remove_clears_indices() {
        let registry = SessionRegistry::new();
        let handle = registry.create("imsi-1", 1, snssai(), "internet");
        let seid = registry.allocate_seid(handle.id());

        assert!(registry.remove(handle.id()).is_some());
        assert!(registry.is_empty());
        assert!(registry.find_by_ref(handle.sm_context_ref()).is_none());
        assert!(registry.find_by_supi_psi("imsi-1", 1).is_none());
        assert!(registry.find_by_seid(seid).is_none());
        assert!(registry.remove(handle.id()).is_none());
    }

    #[test]
    fn test_duplicate_keeps_new_index() {
        let registry = SessionRegistry::new();
        let old = registry.create("imsi-1", 1, snssai(), "internet");
        let new = registry.create("imsi-1", 1, snssai(), "internet");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_supi_psi("imsi-1", 1).unwrap().id(), new.id());

        registry.remove(old.id());
        assert_eq!(registry.find_by_supi_psi("imsi-1", 1).unwrap().id(), new.id());
        assert!(registry.find_by_ref(old.sm_context_ref()).is_none());
    }
}
