use domain::common::error::DomainError;
use domain::service::entity::{BackendId, BackendKey, L3n4Addr, ServiceId};

/// Secondary port for the frontend and backend identifier allocator.
///
/// Acquiring an identifier for an address that already holds one returns the
/// existing identifier.
pub trait IdAllocatorPort: Send + Sync {
    /// Allocate an identifier for `addr`, preferring `hint` when non-zero and free.
    fn acquire_frontend_id(
        &mut self,
        addr: &L3n4Addr,
        hint: ServiceId,
    ) -> Result<ServiceId, DomainError>;

    /// Re-register an identifier recovered from the datapath.
    fn restore_frontend_id(&mut self, addr: &L3n4Addr, id: ServiceId) -> Result<(), DomainError>;

    fn delete_frontend_id(&mut self, id: ServiceId) -> Result<(), DomainError>;

    fn acquire_backend_id(&mut self, key: &BackendKey) -> Result<BackendId, DomainError>;

    fn restore_backend_id(&mut self, key: &BackendKey, id: BackendId) -> Result<(), DomainError>;

    fn delete_backend_id(&mut self, id: BackendId);
}
