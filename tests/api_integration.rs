//! End-to-end flow through the HTTP router: init, unseal, scoped tokens,
//! credential retrieval, the startup gate, optimistic writes and reseal.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vaultkeeper::api::build_router;

async fn call(router: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder.header("content-type", "application/json").body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test]
async fn test_operator_and_service_flow() {
    let dir = TempDir::new().unwrap();
    let orchestrator = common::orchestrator(&dir).await;
    let router = build_router(orchestrator.clone());

    let (status, body) = call(&router, Method::GET, "/v1/sys/seal-status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "uninitialized");

    let (status, init) = call(&router, Method::POST, "/v1/sys/init", None, Some(json!({"shares": 3, "threshold": 2}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let shares: Vec<String> = serde_json::from_value(init["shares"].clone()).unwrap();
    let admin = init["admin_token"].as_str().unwrap().to_string();
    assert_eq!(shares.len(), 3);
    assert!(admin.starts_with("vk_admin_"));

    let (status, _) = call(&router, Method::POST, "/v1/sys/init", None, Some(json!({"shares": 3, "threshold": 2}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // sealed: service reads fail with a retryable status
    let (status, body) = call(&router, Method::GET, "/v1/credentials/postgres", Some(&admin), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "sealed");

    for share in &shares[1..] {
        call(&router, Method::POST, "/v1/sys/unseal", None, Some(json!({"share": share}))).await;
    }
    let (_, body) = call(&router, Method::GET, "/v1/sys/seal-status", None, None).await;
    assert_eq!(body["state"], "unsealed");

    let (status, token) = call(&router, Method::POST, "/v1/admin/tokens/postgres", Some(&admin), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let postgres = token["token"].as_str().unwrap().to_string();
    assert!(postgres.starts_with("vk_svc_"));

    let (status, record) = call(&router, Method::GET, "/v1/credentials/postgres", Some(&postgres), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["username"], "app");
    assert_eq!(record["version"], 1);
    assert_eq!(record["password"].as_str().unwrap().len(), 32);

    let (status, body) = call(&router, Method::GET, "/v1/credentials/pgbouncer", Some(&postgres), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
    let (status, _) = call(&router, Method::GET, "/v1/admin/status", Some(&postgres), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, tls) = call(&router, Method::GET, "/v1/tls/postgres", Some(&postgres), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(tls["private_key_pem"].as_str().unwrap().contains("PRIVATE KEY"));

    let (status, body) = call(&router, Method::GET, "/v1/tls/redis", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_configured");

    // gate releases once the coordinator runs
    let cancel = CancellationToken::new();
    let coordinator = orchestrator.coordinator().clone();
    let runner = {
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };
    let (status, gate) = call(&router, Method::GET, "/v1/gate/postgres?timeout_secs=5", Some(&postgres), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gate["ready"], true);
    let report = runner.await.unwrap();
    assert!(report.is_complete());

    // optimistic writes
    let put = json!({"username": "cache", "password": "cache-password-1", "tls_enabled": false, "expected_version": 1});
    let (status, body) = call(&router, Method::PUT, "/v1/admin/credentials/redis", Some(&admin), Some(put.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["version"], 2);
    let (status, body) = call(&router, Method::PUT, "/v1/admin/credentials/redis", Some(&admin), Some(put)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
    assert_eq!(body["details"]["actual"], 2);

    let (status, entries) = call(&router, Method::GET, "/v1/admin/audit?limit=50", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = entries.as_array().unwrap().iter().filter_map(|e| e["action"].as_str()).collect();
    assert!(actions.contains(&"credentials.read"));
    assert!(actions.contains(&"credentials.write"));
    cancel.cancel();

    // reseal
    let (status, body) = call(&router, Method::POST, "/v1/sys/seal", Some(&admin), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "sealed");
    let (status, _) = call(&router, Method::GET, "/v1/credentials/postgres", Some(&postgres), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rejects_bad_requests() {
    let dir = TempDir::new().unwrap();
    let orchestrator = common::orchestrator(&dir).await;
    let router = build_router(orchestrator);

    let (status, body) = call(&router, Method::POST, "/v1/sys/init", None, Some(json!({"shares": 0, "threshold": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = call(&router, Method::GET, "/v1/admin/audit", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
