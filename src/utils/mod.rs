pub mod balance_cache;
pub mod dispatch_gate;
pub mod fetch_data;
pub mod ttl_cache;
