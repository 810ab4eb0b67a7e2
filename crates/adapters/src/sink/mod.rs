pub mod health_table;
pub mod log_monitor;
pub mod proxy_table;
