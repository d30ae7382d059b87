//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestClient, TestServer, ECHO_TOOL, TOOLS_SERVER};
//! use reqwest::StatusCode;
//!
//! #[tokio::test]
//! async fn test_echo() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::new(server.base_url.clone(), &server.agent_key);
//!
//!     let response = client.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
//!     assert_eq!(response.status(), StatusCode::OK);
//! }
//! ```

#![allow(dead_code)]

mod client;
mod constants;
mod fixtures;
mod server;

// Public API - this is what tests import
pub use client::{error_code, TestClient};
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::MockDownstream;
pub use server::{test_settings, TestServer};
