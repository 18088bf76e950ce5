// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod execution;
pub mod feed;
pub mod gate;
pub mod models;
pub mod pricing;
pub mod reconcile;

// Re-export commonly used types
pub use config::Settings;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
