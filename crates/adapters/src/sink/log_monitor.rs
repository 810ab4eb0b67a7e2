use domain::common::error::DomainError;
use ports::secondary::monitor_port::{MonitorEvent, MonitorPort};

/// Monitor sink that emits each event as a JSON payload via `tracing`.
///
/// Logged at INFO with `event_type = "lb_monitor"` so that registry
/// transitions can be filtered in log aggregation systems.
pub struct LogMonitor;

impl MonitorPort for LogMonitor {
    fn send_notification(&self, event: &MonitorEvent) -> Result<(), DomainError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| DomainError::EngineError(format!("monitor event encoding failed: {e}")))?;
        tracing::info!(
            event_type = "lb_monitor",
            kind = event.kind(),
            payload = %payload,
            "service registry event"
        );
        Ok(())
    }
}
