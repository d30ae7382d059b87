use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{error, info};

use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::gateway_routes::make_gateway_routes;
use super::metrics::metrics_handler;
#[cfg(feature = "slowdown")]
use super::slowdown_request;
use super::{log_requests, state::*, ServerConfig};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub version: &'static str,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn make_app(
    config: ServerConfig,
    gateway: GuardedGateway,
    caller_store: GuardedCallerStore,
) -> Router {
    let state = ServerState::new(config, gateway, caller_store);

    let home_router: Router = Router::new()
        .route("/", get(home))
        .with_state(state.clone());

    let mut app: Router = home_router.nest("/gateway/v1", make_gateway_routes(state.clone()));

    #[cfg(feature = "slowdown")]
    {
        app = app.layer(middleware::from_fn(slowdown_request));
    }
    app = app.layer(middleware::from_fn_with_state(state, log_requests));

    app
}

fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections...");
}

pub async fn run_server(
    config: ServerConfig,
    gateway: GuardedGateway,
    caller_store: GuardedCallerStore,
) -> Result<()> {
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, gateway, caller_store);

    let metrics_listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", metrics_port)).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, make_metrics_app()).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Ready to serve at port {}!", port);
    info!("Metrics available at port {}!", metrics_port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        AuditLogger, CircuitBreaker, CredentialCipher, Gateway, GatewaySettings, HttpForwarder,
        RateLimiter, RegistryNotifier, TrustClassifier, DEFAULT_MAX_RESPONSE_BYTES,
    };
    use crate::store::{Caller, CallerRole, MemoryGatewayStore};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt; // for `oneshot`

    fn app_with(store: MemoryGatewayStore, config: ServerConfig) -> Router {
        let store = Arc::new(store);
        let cipher =
            Arc::new(CredentialCipher::from_base64_key(&CredentialCipher::generate_key()).unwrap());
        let gateway = Gateway::new(
            store.clone(),
            TrustClassifier::new(store.clone(), store.clone()),
            Arc::new(CircuitBreaker::new()),
            Arc::new(RateLimiter::new()),
            Arc::new(HttpForwarder::new(cipher, DEFAULT_MAX_RESPONSE_BYTES).unwrap()),
            AuditLogger::new(store.clone()),
            RegistryNotifier::disabled(),
            GatewaySettings::default(),
        );
        make_app(config, Arc::new(gateway), store)
    }

    fn store() -> MemoryGatewayStore {
        MemoryGatewayStore::new()
            .with_caller(
                "tg_agent",
                Caller {
                    id: "agent-1".to_string(),
                    role: CallerRole::Agent,
                    workspace_id: "w1".to_string(),
                },
            )
            .with_caller(
                "tg_observer",
                Caller {
                    id: "observer-1".to_string(),
                    role: CallerRole::Observer,
                    workspace_id: "w1".to_string(),
                },
            )
    }

    fn post(uri: &str, token: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn error_code(response: axum::response::Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["error"]["code"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 01:01:01");
    }

    #[tokio::test]
    async fn responds_unauthorized_without_valid_key() {
        let app = app_with(store(), ServerConfig::default());

        for token in [None, Some("tg_wrong")] {
            let response = app
                .clone()
                .oneshot(post("/gateway/v1/proxy/s1/tools/search", token, "{}"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(error_code(response).await, "UNAUTHORIZED");
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/gateway/v1/tools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn observers_cannot_invoke_tools() {
        let app = app_with(store(), ServerConfig::default());

        let response = app
            .oneshot(post(
                "/gateway/v1/proxy/s1/tools/search",
                Some("tg_observer"),
                "{}",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(response).await, "FORBIDDEN");
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let app = app_with(store(), ServerConfig::default());

        let response = app
            .oneshot(post(
                "/gateway/v1/proxy/s1/tools/search",
                Some("tg_agent"),
                "{oops",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let app = app_with(store(), ServerConfig::default());

        let response = app
            .oneshot(post(
                "/gateway/v1/proxy/nope/tools/search",
                Some("tg_agent"),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, "SERVER_NOT_FOUND");
    }

    #[tokio::test]
    async fn repeated_bad_keys_are_rate_limited() {
        let config = ServerConfig {
            auth_attempts_per_minute: 2,
            ..ServerConfig::default()
        };
        let app = app_with(store(), config);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post("/gateway/v1/proxy/s1/tools/x", Some("tg_bad"), ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // Even a valid key is refused until the window passes
        let response = app
            .oneshot(post("/gateway/v1/proxy/s1/tools/x", Some("tg_agent"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn home_reports_uptime() {
        let app = app_with(store(), ServerConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
