pub mod auth;
pub mod metrics;
pub mod payment_api;
pub mod store;
