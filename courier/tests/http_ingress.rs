//! HTTP ingress: routes exercised in-process over in-memory backends.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use courier::{Courier, HttpConfig, IngressServer, Pipeline, ServerError, server::router};
use courier_common::{Signal, SystemClock};
use httpmock::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tower::ServiceExt;

async fn pipeline(base_url: &str) -> Arc<Pipeline> {
    let config = format!(
        r#"Courier(
            broker: (backend: Memory(partitions: 2)),
            providers: (
                timeout_secs: 5,
                gmail_base_url: "{base_url}",
                outlook_base_url: "{base_url}/v1.0",
            ),
            rate_limit: (limit: 2, window_secs: 3600),
        )"#
    );
    let courier = Courier::from_ron(&config).expect("valid config");
    Arc::new(courier.build(Arc::new(SystemClock)).await.expect("pipeline builds"))
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn email(user: &str) -> Value {
    json!({
        "tenantId": "acme",
        "userId": user,
        "toAddress": "reader@example.com",
        "subject": "Weekly report",
        "body": "<p>All green</p>",
    })
}

#[tokio::test]
async fn test_send_queues_until_rate_limited() {
    let server = MockServer::start_async().await;
    let pipeline = pipeline(&server.base_url()).await;
    let router = router(Arc::clone(&pipeline));

    for _ in 0..2 {
        let (status, body) = call(&router, "POST", "/email/send", Some(email("u-1"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message"], "Email queued for sending");
        assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    let (status, body) = call(&router, "POST", "/email/send", Some(email("u-1"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["message"], "Too many requests, please try again later.");

    let (status, _) = call(&router, "POST", "/email/send", Some(email("u-2"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    pipeline.broker().shutdown().await;
}

#[tokio::test]
async fn test_send_rejects_malformed_and_exhausted_requests() {
    let server = MockServer::start_async().await;
    let pipeline = pipeline(&server.base_url()).await;
    let router = router(Arc::clone(&pipeline));

    let (status, _) = call(&router, "POST", "/email/send", Some(json!({ "userId": "u-1" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let mut exhausted = email("u-1");
    exhausted["retryCount"] = json!(5);
    let (status, body) = call(&router, "POST", "/email/send", Some(exhausted)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Rejected: retry count 5 leaves no attempts");

    pipeline.broker().shutdown().await;
}

#[tokio::test]
async fn test_credentials_lifecycle() {
    let server = MockServer::start_async().await;
    let profile = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/gmail/v1/users/me/profile")
                .header("authorization", "Bearer good");
            then.status(200).body("{}");
        })
        .await;
    let pipeline = pipeline(&server.base_url()).await;
    let router = router(Arc::clone(&pipeline));

    let (status, body) = call(
        &router,
        "POST",
        "/credentials",
        Some(json!({
            "userId": "u-1",
            "tenantId": "acme",
            "provider": "gmail",
            "credentials": { "access_token": "good" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["message"], "Credentials stored successfully");
    profile.assert_async().await;

    let (status, body) = call(&router, "GET", "/credentials/u-1/acme/gmail", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hasCredentials"], true);

    let (status, body) = call(&router, "GET", "/credentials/u-1/acme/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "providers": ["gmail"] }));

    let (status, body) = call(&router, "GET", "/credentials/u-1/acme/outlook", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["hasCredentials"], false);

    let (status, _) = call(&router, "DELETE", "/credentials/u-1/acme/gmail", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&router, "DELETE", "/credentials/u-1/acme/gmail", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "No credentials found to delete");

    let (_, body) = call(&router, "GET", "/credentials/u-1/acme/providers", None).await;
    assert_eq!(body, json!({ "providers": [] }));

    pipeline.broker().shutdown().await;
}

#[tokio::test]
async fn test_rejected_credentials_are_not_stored() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gmail/v1/users/me/profile");
            then.status(401);
        })
        .await;
    let pipeline = pipeline(&server.base_url()).await;
    let router = router(Arc::clone(&pipeline));

    let (status, body) = call(
        &router,
        "POST",
        "/credentials",
        Some(json!({
            "userId": "u-1",
            "tenantId": "acme",
            "provider": "gmail",
            "credentials": { "access_token": "stale" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Credentials rejected by gmail");

    let (_, body) = call(&router, "GET", "/credentials/u-1/acme/providers", None).await;
    assert_eq!(body, json!({ "providers": [] }));

    let (status, body) = call(&router, "GET", "/credentials/u-1/acme/sendgrid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Unknown provider: sendgrid");

    pipeline.broker().shutdown().await;
}

#[tokio::test]
async fn test_server_binds_and_stops_on_shutdown() {
    let server = MockServer::start_async().await;
    let pipeline = pipeline(&server.base_url()).await;
    let config = HttpConfig {
        listen_address: "127.0.0.1:0".to_string(),
        ..HttpConfig::default()
    };

    let ingress = IngressServer::new(&config, Arc::clone(&pipeline))
        .await
        .unwrap();
    assert_ne!(ingress.local_addr().unwrap().port(), 0);

    let (signals, _) = broadcast::channel(4);
    let serving = tokio::spawn(ingress.serve(signals.subscribe()));
    signals.send(Signal::Shutdown).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let invalid = HttpConfig {
        listen_address: "not-an-address".to_string(),
        ..HttpConfig::default()
    };
    assert!(matches!(
        IngressServer::new(&invalid, pipeline).await,
        Err(ServerError::Bind { .. })
    ));
}
