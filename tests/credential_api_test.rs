// Integration tests for the credential HTTP API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use credvault::api::{create_api_router, ApiAppState, CredentialApi};
use credvault::credentials::CredentialStore;
use credvault::oauth::{FlowManager, FlowSettings, HttpTokenExchanger, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn json_body(body: &str) -> Body {
    Body::from(body.to_string())
}

fn create_test_app() -> Router {
    let key = BASE64.encode([0u8; 32]);
    let store = Arc::new(CredentialStore::new(":memory:", &key).unwrap());
    let exchanger = HttpTokenExchanger::new(Duration::from_secs(5), Duration::from_millis(10)).unwrap();
    let flows = FlowManager::new(
        store,
        ProviderRegistry::new(),
        Arc::new(exchanger),
        FlowSettings::default(),
    );

    create_api_router(ApiAppState {
        api: CredentialApi::new(flows),
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            json_body(json)
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_add_and_list_credentials() {
    let app = create_test_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/credentials",
        Some(r#"{"service_name":"github","client_id":"cid123","client_secret":"secret456"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json["id"].as_i64().unwrap();

    let (status, json) = send(&app, "GET", "/api/credentials", None).await;
    assert_eq!(status, StatusCode::OK);

    let credentials = json["credentials"].as_array().unwrap();
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0]["id"], id);
    assert_eq!(credentials[0]["service_name"], "github");
    assert_eq!(credentials[0]["client_id"], "cid123");
    assert_eq!(credentials[0]["has_token"], false);

    // Secret never leaves through the listing
    assert!(credentials[0].get("client_secret").is_none());
    assert!(!json.to_string().contains("secret456"));
}

#[tokio::test]
async fn test_add_credential_with_empty_field() {
    let app = create_test_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/credentials",
        Some(r#"{"service_name":"github","client_id":"","client_secret":"secret456"}"#),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("validation"));
    assert!(!json.to_string().contains("secret456"));

    let (_, json) = send(&app, "GET", "/api/credentials", None).await;
    assert!(json["credentials"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_credential() {
    let app = create_test_app();

    let (_, json) = send(
        &app,
        "POST",
        "/api/credentials",
        Some(r#"{"service_name":"github","client_id":"cid","client_secret":"s"}"#),
    )
    .await;
    let id = json["id"].as_i64().unwrap();

    let (status, json) = send(&app, "DELETE", &format!("/api/credentials/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, _) = send(&app, "DELETE", &format!("/api/credentials/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_oauth_flow() {
    let app = create_test_app();

    let (_, json) = send(
        &app,
        "POST",
        "/api/credentials",
        Some(r#"{"service_name":"github","client_id":"cid123","client_secret":"secret456"}"#),
    )
    .await;
    let id = json["id"].as_i64().unwrap();

    let (status, json) = send(&app, "POST", &format!("/api/credentials/{}/oauth/start", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let url = json["authorization_url"].as_str().unwrap();
    assert!(url.contains("client_id=cid123"));
    assert!(url.contains("state="));
    let flow_id = json["flow_id"].as_str().unwrap().to_string();

    let (status, json) = send(&app, "GET", &format!("/api/flows/{}", flow_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["credential_id"], id);
    assert_eq!(json["status"]["status"], "awaiting_redirect");

    let (status, json) = send(&app, "GET", &format!("/api/credentials/{}/oauth/latest", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["flow_id"], flow_id);
}

#[tokio::test]
async fn test_start_oauth_flow_unknown_credential() {
    let app = create_test_app();

    let (status, json) = send(&app, "POST", "/api/credentials/999/oauth/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "credential 999 not found");
}

#[tokio::test]
async fn test_start_oauth_flow_unconfigured_provider() {
    let app = create_test_app();

    let (_, json) = send(
        &app,
        "POST",
        "/api/credentials",
        Some(r#"{"service_name":"acme","client_id":"cid","client_secret":"s"}"#),
    )
    .await;
    let id = json["id"].as_i64().unwrap();

    let (status, _) = send(&app, "POST", &format!("/api/credentials/{}/oauth/start", id), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_unknown_flow() {
    let app = create_test_app();

    let (status, _) = send(&app, "GET", "/api/flows/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
