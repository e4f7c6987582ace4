pub mod config;
pub mod exchange;
pub mod interfaces;
pub mod rpc;
pub mod services;
pub mod utils;
