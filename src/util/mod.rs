pub mod cache;
pub mod throttle;
pub mod ttl_map;
