pub mod config;
pub mod format;
pub mod observability;
pub mod pointstore;
pub mod series;
pub mod store;
pub mod types;
