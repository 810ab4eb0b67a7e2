#![forbid(unsafe_code)]

pub mod l7_service_impl;
pub mod service_registry_impl;
pub mod service_sync_impl;
pub mod shared_registry;

#[cfg(test)]
mod test_support;
