pub mod aggregator;
pub mod discovery;
pub mod executor;
pub mod ledger;
