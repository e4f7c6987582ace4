pub mod db;
pub mod env;

pub use db::{connect_db, Store};
pub use env::{load_env, Env, SizingPolicy};
