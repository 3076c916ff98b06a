//! Black-box coverage for `POST /call` preflight failure paths (§4.9):
//! every check runs against a config pointed at closed local ports, so
//! origination must fail before any call is placed, and it must fail
//! without hanging.

#[path = "support/mod.rs"]
mod support;

use callcore::server::http::originate_call;
use tempfile::NamedTempFile;

#[tokio::test]
async fn originate_fails_when_every_dependency_is_unreachable() {
    let tmp = NamedTempFile::new().expect("temp config file");
    let config = support::unreachable_config(&tmp);
    let state = support::test_state(config);

    let result = originate_call(&state, "+15551234567", "book a table", "party of two").await;

    assert!(result.is_err(), "preflight should reject an unreachable dependency stack");
    assert!(state.sessions.lock().await.is_empty(), "no session should be registered on preflight failure");
}

#[tokio::test]
async fn originate_over_http_surfaces_preflight_failure_as_bad_request() {
    let tmp = NamedTempFile::new().expect("temp config file");
    let config = support::unreachable_config(&tmp);
    let state = support::test_state(config);
    let addr = support::spawn_router(state).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/call"))
        .json(&serde_json::json!({
            "phoneNumber": "+15551234567",
            "goal": "confirm the reservation",
            "context": "caller prefers evenings",
        }))
        .send()
        .await
        .expect("request should complete even though the call itself is rejected");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body = response.text().await.expect("body");
    assert!(!body.is_empty(), "failure reason should be surfaced to the caller");
}

#[tokio::test]
async fn originate_rejects_oversized_goal_before_touching_any_dependency() {
    let tmp = NamedTempFile::new().expect("temp config file");
    let config = support::unreachable_config(&tmp);
    let state = support::test_state(config);
    let addr = support::spawn_router(state).await;

    let client = reqwest::Client::new();
    let oversized_goal = "x".repeat(2000);
    let response = client
        .post(format!("http://{addr}/call"))
        .json(&serde_json::json!({
            "phoneNumber": "+15551234567",
            "goal": oversized_goal,
            "context": "",
        }))
        .send()
        .await
        .expect("request should complete");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}
