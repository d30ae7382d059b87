use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;
use crate::gateway::{Gateway, RateLimiter};
use crate::store::CallerStore;

pub type GuardedGateway = Arc<Gateway>;
pub type GuardedCallerStore = Arc<dyn CallerStore>;
pub type GuardedAuthLimiter = Arc<RateLimiter>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub gateway: GuardedGateway,
    pub caller_store: GuardedCallerStore,
    pub auth_limiter: GuardedAuthLimiter,
}

impl ServerState {
    pub fn new(config: ServerConfig, gateway: GuardedGateway, caller_store: GuardedCallerStore) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            gateway,
            caller_store,
            auth_limiter: Arc::new(RateLimiter::new()),
        }
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedGateway {
    fn from_ref(input: &ServerState) -> Self {
        input.gateway.clone()
    }
}

impl FromRef<ServerState> for GuardedCallerStore {
    fn from_ref(input: &ServerState) -> Self {
        input.caller_store.clone()
    }
}
