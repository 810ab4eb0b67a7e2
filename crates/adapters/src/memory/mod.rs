pub mod id_allocator;
pub mod lb_map_store;
