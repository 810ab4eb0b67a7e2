use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::service::entity::{L3n4Addr, LbSvc, ResourceName, ServiceId, ServiceName};
use domain::service::error::ServiceError;
use domain::service::options::InitMapsFlags;

use crate::service_registry_impl::ServiceRegistry;
use crate::service_sync_impl::RestoreSummary;

/// Cloneable handle serializing access to one [`ServiceRegistry`].
///
/// Queries share a read lock; every mutation, including the map writes it
/// triggers, runs under the write lock.
#[derive(Clone)]
pub struct SharedServiceRegistry {
    inner: Arc<RwLock<ServiceRegistry>>,
}

impl SharedServiceRegistry {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceRegistry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceRegistry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn init_maps(&self, flags: &InitMapsFlags) -> Result<(), ServiceError> {
        self.write().init_maps(flags)
    }

    pub fn restore_all(&self) -> RestoreSummary {
        self.write().restore_all()
    }

    pub fn sync_finished(&self) -> Result<usize, ServiceError> {
        self.write().sync_finished()
    }

    pub fn upsert(&self, svc: LbSvc) -> Result<(bool, ServiceId), ServiceError> {
        self.write().upsert(svc)
    }

    pub fn delete_by_id(&self, id: ServiceId) -> Result<bool, ServiceError> {
        self.write().delete_by_id(id)
    }

    pub fn delete_by_address(&self, frontend: &L3n4Addr) -> Result<bool, ServiceError> {
        self.write().delete_by_address(frontend)
    }

    pub fn register_l7lb_service(
        &self,
        name: &ServiceName,
        resource: &ResourceName,
        proxy_port: u16,
    ) -> Result<(), ServiceError> {
        self.write().register_l7lb_service(name, resource, proxy_port)
    }

    pub fn register_l7lb_backend_sync(
        &self,
        name: &ServiceName,
        resource: &ResourceName,
    ) -> Result<(), ServiceError> {
        self.write().register_l7lb_backend_sync(name, resource)
    }

    pub fn remove_l7lb_service(
        &self,
        name: &ServiceName,
        resource: &ResourceName,
    ) -> Result<(), ServiceError> {
        self.write().remove_l7lb_service(name, resource)
    }

    pub fn get_by_id(&self, id: ServiceId) -> Option<LbSvc> {
        self.read().get_by_id(id)
    }

    pub fn get_by_address(&self, frontend: &L3n4Addr) -> Option<LbSvc> {
        self.read().get_by_address(frontend)
    }

    pub fn get_all(&self) -> Vec<LbSvc> {
        self.read().get_all()
    }

    pub fn get_all_by_name(&self, name: &ServiceName) -> Vec<LbSvc> {
        self.read().get_all_by_name(name)
    }

    pub fn get_service_name_by_address(&self, frontend: &L3n4Addr) -> Option<ServiceName> {
        self.read().get_service_name_by_address(frontend)
    }

    pub fn l7lb_proxy_port(&self, name: &ServiceName) -> u16 {
        self.read().l7lb_proxy_port(name)
    }

    pub fn service_count(&self) -> usize {
        self.read().service_count()
    }

    /// Run `f` against a consistent view of the registry.
    pub fn with_read<R>(&self, f: impl FnOnce(&ServiceRegistry) -> R) -> R {
        f(&self.read())
    }
}
