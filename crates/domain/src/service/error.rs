use thiserror::Error;

use crate::common::entity::IpFamily;
use crate::common::error::DomainError;

use super::entity::NatPolicy;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {frontend}: backends mix IPv4 and IPv6 addresses")]
    MixedBackendFamilies { frontend: String },

    #[error("{family} support is disabled, cannot program {addr}")]
    FamilyDisabled { family: IpFamily, addr: String },

    #[error("service {frontend} requires {policy} but NAT46/64 support is disabled")]
    NatDisabled { frontend: String, policy: NatPolicy },

    #[error("service {service} is already redirected to an L7 proxy by {holder}")]
    L7RedirectConflict { service: String, holder: String },

    #[error("a LocalRedirect service already exists for frontend {frontend}")]
    LocalRedirectExists { frontend: String },

    #[error("LocalRedirect service for {frontend} cannot override existing {existing} service")]
    LocalRedirectOverlap { frontend: String, existing: String },

    #[error("invalid source range: {cidr}")]
    InvalidSourceRange { cidr: String },

    #[error("unable to allocate frontend id for {frontend}: {source}")]
    FrontendIdAllocation {
        frontend: String,
        #[source]
        source: DomainError,
    },

    #[error("unable to allocate backend id for {backend}: {source}")]
    BackendIdAllocation {
        backend: String,
        #[source]
        source: DomainError,
    },

    #[error("unable to release frontend id {id}: {source}")]
    FrontendIdRelease {
        id: u16,
        #[source]
        source: DomainError,
    },

    #[error("map store {op} failed: {source}")]
    MapStore {
        op: &'static str,
        #[source]
        source: DomainError,
    },

    #[error("unable to sync proxy endpoints for {service}: {source}")]
    ProxySync {
        service: String,
        #[source]
        source: DomainError,
    },
}

impl ServiceError {
    pub fn map_store(op: &'static str) -> impl FnOnce(DomainError) -> Self {
        move |source| Self::MapStore { op, source }
    }

    /// Validation failures leave registry state untouched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MixedBackendFamilies { .. }
                | Self::FamilyDisabled { .. }
                | Self::NatDisabled { .. }
                | Self::L7RedirectConflict { .. }
                | Self::LocalRedirectExists { .. }
                | Self::LocalRedirectOverlap { .. }
                | Self::InvalidSourceRange { .. }
        )
    }
}

impl From<ServiceError> for DomainError {
    fn from(e: ServiceError) -> Self {
        if e.is_validation() {
            Self::InvalidRule(e.to_string())
        } else {
            Self::EngineError(e.to_string())
        }
    }
}
