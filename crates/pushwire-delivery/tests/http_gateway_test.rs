//! HTTP relay gateway against a mock endpoint.

use pushwire_core::{App, Notification, Protocol};
use pushwire_delivery::{DeliveryError, Gateway, HttpGateway, HttpGatewayConfig};
use pushwire_testing::{NotificationBuilder, TestEnv};
use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn setup(server: &MockServer) -> (TestEnv, App, HttpGateway, Vec<Notification>) {
    let env = TestEnv::new();
    let app = App::new(
        "relay",
        Protocol::Webhook,
        json!({"endpoint": format!("{}/push", server.uri()), "auth_token": "secret"}),
        env.now(),
    );
    env.store.add_app(app.clone()).await;
    let gateway = HttpGateway::from_app(&app, &HttpGatewayConfig::default()).unwrap();

    let token = NotificationBuilder::new().create(&env, &app).await.unwrap();
    let fanout = NotificationBuilder::new().registration_ids(&["r1", "r2"]).create(&env, &app).await.unwrap();
    (env, app, gateway, vec![token, fanout])
}

async fn respond_with(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST")).and(path("/push")).respond_with(response).mount(server).await;
}

#[tokio::test]
async fn posts_batch_as_json_with_bearer_token() {
    let server = MockServer::start().await;
    let (_env, app, gateway, batch) = setup(&server).await;

    Mock::given(method("POST"))
        .and(path("/push"))
        .and(header("authorization", "Bearer secret"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({
            "app": "relay",
            "notifications": [
                {"id": batch[0].id, "device_token": "0".repeat(64), "alert": "test alert"},
                {"id": batch[1].id, "registration_ids": ["r1", "r2"]},
            ]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    gateway.send(&app, &batch).await.unwrap();
}

#[tokio::test]
async fn too_many_requests_honours_retry_after() {
    let server = MockServer::start().await;
    let (_env, app, gateway, batch) = setup(&server).await;
    respond_with(&server, ResponseTemplate::new(429).insert_header("Retry-After", "17")).await;

    let err = gateway.send(&app, &batch).await.unwrap_err();

    assert!(matches!(err, DeliveryError::RateLimited { retry_after_seconds: 17 }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn too_many_requests_without_header_waits_a_minute() {
    let server = MockServer::start().await;
    let (_env, app, gateway, batch) = setup(&server).await;
    respond_with(&server, ResponseTemplate::new(429)).await;

    let err = gateway.send(&app, &batch).await.unwrap_err();
    assert!(matches!(err, DeliveryError::RateLimited { retry_after_seconds: 60 }));
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;
    let (_env, app, gateway, batch) = setup(&server).await;
    respond_with(&server, ResponseTemplate::new(503).set_body_string("maintenance")).await;

    let err = gateway.send(&app, &batch).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Rejected { status: 503, .. }));
    assert!(err.is_retryable());
    assert_eq!(err.code(), None);
}

#[tokio::test]
async fn relay_errors_carry_protocol_code() {
    let server = MockServer::start().await;
    let (_env, app, gateway, batch) = setup(&server).await;
    respond_with(
        &server,
        ResponseTemplate::new(400).set_body_json(json!({"code": 8, "message": "Invalid token"})),
    )
    .await;

    let err = gateway.send(&app, &batch).await.unwrap_err();

    assert_eq!(err.code(), Some(8));
    assert_eq!(err.to_string(), "Invalid token");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn other_client_errors_use_status_as_code() {
    let server = MockServer::start().await;
    let (_env, app, gateway, batch) = setup(&server).await;
    respond_with(&server, ResponseTemplate::new(404).set_body_string("no such route")).await;

    let err = gateway.send(&app, &batch).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Rejected { status: 404, ref body } if body == "no such route"));
    assert_eq!(err.code(), Some(404));
    assert_eq!(err.to_string(), "gateway rejected request: status 404: no such route");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    let env = TestEnv::new();
    let app = App::new(
        "relay",
        Protocol::Webhook,
        json!({"endpoint": "http://127.0.0.1:1/push"}),
        env.now(),
    );
    env.store.add_app(app.clone()).await;
    let gateway = HttpGateway::from_app(&app, &HttpGatewayConfig::default()).unwrap();
    let batch = vec![NotificationBuilder::new().create(&env, &app).await.unwrap()];

    let err = gateway.send(&app, &batch).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Connection { .. }));
    assert!(err.is_retryable());
}
