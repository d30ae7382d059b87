//! Toolgate Server Library
//!
//! This library exposes the internal modules for testing and for the admin CLI.

pub mod config;
pub mod gateway;
pub mod server;
pub mod sqlite_persistence;
pub mod store;

// Re-export commonly used types for convenience
pub use gateway::{Gateway, GatewayError, GatewaySettings};
pub use server::{make_app, run_server, RequestsLoggingLevel};
pub use store::{GatewayStore, MemoryGatewayStore, SqliteGatewayStore};
