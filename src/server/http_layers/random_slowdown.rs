//! Random slowdown middleware for exercising client timeouts
#![allow(dead_code)] // Feature-gated middleware

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use rand::Rng;
use std::time::Duration;

/// Delays each request by a uniformly random 0 to 3 seconds.
pub async fn slowdown_request(request: Request<Body>, next: Next) -> impl IntoResponse {
    let delay_ms = rand::rng().random_range(0..3000);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    next.run(request).await
}
