pub mod chain_decoder;
pub mod chain_listener;
pub mod provider_pool;
