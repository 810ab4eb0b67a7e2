pub mod health_server_port;
pub mod id_allocator_port;
pub mod lb_map_port;
pub mod metrics_port;
pub mod monitor_port;
pub mod proxy_endpoint_port;
