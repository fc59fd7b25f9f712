//! sync-service: checkpointed payment API synchronization and staged CSV
//! imports.
pub mod config;
pub mod dtos;
pub mod handlers;
pub mod import;
pub mod ingest;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
