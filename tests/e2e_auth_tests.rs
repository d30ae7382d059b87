//! End-to-end tests for API key authentication and caller roles

mod common;

use common::{
    error_code, test_settings, TestClient, TestServer, AGENT_ID, ECHO_TOOL, TOOLS_SERVER,
};
use reqwest::StatusCode;

#[tokio::test]
async fn test_home_needs_no_key() {
    let server = TestServer::spawn().await;
    let client = TestClient::anonymous(server.base_url.clone());

    let response = client.home().await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["uptime"].is_string());
}

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let server = TestServer::spawn().await;
    let client = TestClient::anonymous(server.base_url.clone());

    let response = client.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(response).await, "UNAUTHORIZED");

    let response = client.list_tools().await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(server.downstream.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_key_is_unauthorized() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone(), "tg_not-a-real-key");

    let response = client.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // Unauthenticated requests never reach the audited pipeline
    assert!(server.store.recent_audit_entries(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_revoked_key_stops_working() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone(), &server.agent_key);

    let response = client.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(server.store.revoke_caller_keys(AGENT_ID).unwrap(), 1);

    let response = client.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_observer_can_browse_but_not_invoke() {
    let server = TestServer::spawn().await;
    let observer = TestClient::new(server.base_url.clone(), &server.observer_key);

    let response = observer.list_tools().await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = observer.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "FORBIDDEN");
    assert_eq!(server.downstream.call_count(ECHO_TOOL), 0);
}

#[tokio::test]
async fn test_repeated_bad_keys_lock_out_the_client() {
    let server = TestServer::spawn_with(test_settings(), 3).await;
    let bad = TestClient::new(server.base_url.clone(), "tg_guess");
    let good = TestClient::new(server.base_url.clone(), &server.agent_key);

    // Successful authentications don't use up the allowance
    for _ in 0..5 {
        let response = good.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    for _ in 0..3 {
        let response = bad.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = bad.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response
        .headers()
        .contains_key(reqwest::header::RETRY_AFTER));

    // The lockout is per client address, so a valid key from the same
    // address is refused too
    let response = good.call_tool(TOOLS_SERVER, ECHO_TOOL, None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_code(response).await, "RATE_LIMITED");
}
