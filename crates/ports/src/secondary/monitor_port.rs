use serde::Serialize;

use domain::common::error::DomainError;
use domain::service::entity::{
    BackendKey, L3n4Addr, ServiceId, ServiceName, SvcType, TrafficPolicy,
};

/// Notification emitted after a registry transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    ServiceUpsert {
        id: ServiceId,
        frontend: L3n4Addr,
        backends: Vec<BackendKey>,
        svc_type: SvcType,
        traffic_policy: TrafficPolicy,
        name: ServiceName,
    },
    ServiceDelete {
        id: ServiceId,
    },
}

impl MonitorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceUpsert { .. } => "service_upsert",
            Self::ServiceDelete { .. } => "service_delete",
        }
    }
}

/// Secondary port for the monitor notification sink.
pub trait MonitorPort: Send + Sync {
    fn send_notification(&self, event: &MonitorEvent) -> Result<(), DomainError>;
}
