pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod forms;
pub mod models;
pub mod openapi;
pub mod pagination;
pub mod repo;
pub mod routes;
pub mod security;
pub mod storage;
pub mod telemetry;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use security::SecurityHeaders;
