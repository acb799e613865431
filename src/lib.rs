pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod numbers;
pub mod observability;
pub mod policy;
pub mod wal;
