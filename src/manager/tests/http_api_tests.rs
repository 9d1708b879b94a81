//! Management router tests driven through `tower::ServiceExt::oneshot`.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bridge::{BridgeContext, ConnectionTuning, DeliveryBus, MockNetwork, ModuleRegistry};
use manager::{router, ConnectorSystem};
use serde_json::{json, Value};
use std::sync::Arc;
use storage::{ConnectorStore, StorageManager};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    _bus: DeliveryBus,
    _dir: TempDir,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn ConnectorStore> = Arc::new(StorageManager::new(dir.path()).unwrap());
    let network = MockNetwork::new();
    let registry = ModuleRegistry::with_builtin_modules(BridgeContext::new(
        Arc::new(network),
        ConnectionTuning::default(),
    ));
    let bus = DeliveryBus::default();
    let system = Arc::new(ConnectorSystem::new(registry, storage, bus.handle()));
    TestApp {
        app: router(system),
        _bus: bus,
        _dir: dir,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(raw) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(raw.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

fn beeclear_body(running: bool) -> String {
    json!({
        "name": "meter",
        "description": "kitchen meter",
        "module": "BeeClear",
        "running": running,
        "settings": {"bcHost": "http://beeclear.local/", "mappings": []}
    })
    .to_string()
}

#[tokio::test]
async fn test_list_modules() {
    let t = test_app();
    let (status, body) = send(&t.app, Method::GET, "/Modules", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["BeeClear", "MQTT", "Netatmo"]);
    assert!(body[0]["description"].is_string());
}

#[tokio::test]
async fn test_connector_crud_round() {
    let t = test_app();
    let (status, created) =
        send(&t.app, Method::POST, "/Connectors", Some(&beeclear_body(false))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["module"], "BeeClear");
    assert_eq!(created["running"], false);

    let (status, fetched) = send(&t.app, Method::GET, &format!("/Connectors/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    let (status, patched) = send(
        &t.app,
        Method::PATCH,
        &format!("/Connectors/{id}"),
        Some(r#"{"id":"ignored","name":"renamed"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["id"], id.as_str());
    assert_eq!(patched["name"], "renamed");
    assert_eq!(patched["settings"], created["settings"]);

    let (status, listed) = send(&t.app, Method::GET, "/Connectors", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = send(&t.app, Method::DELETE, &format!("/Connectors/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&t.app, Method::GET, &format!("/Connectors/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_and_stop_return_empty_ok() {
    let t = test_app();
    let (_, created) = send(&t.app, Method::POST, "/Connectors", Some(&beeclear_body(false))).await;
    let id = created["id"].as_str().unwrap();

    let (status, body) = send(&t.app, Method::POST, &format!("/Connectors/{id}/Start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
    let (_, fetched) = send(&t.app, Method::GET, &format!("/Connectors/{id}"), None).await;
    assert_eq!(fetched["running"], true);

    let (status, _) = send(&t.app, Method::POST, &format!("/Connectors/{id}/Stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&t.app, Method::POST, &format!("/Connectors/{id}/Stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, fetched) = send(&t.app, Method::GET, &format!("/Connectors/{id}"), None).await;
    assert_eq!(fetched["running"], false);
}

#[tokio::test]
async fn test_error_bodies_follow_envelope() {
    let t = test_app();

    let (status, body) = send(&t.app, Method::GET, "/Connectors/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        json!({"error": {"status": "Not Found", "code": 404, "message": "Connector missing not found"}})
    );

    let (status, body) = send(&t.app, Method::POST, "/Connectors", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
    assert_eq!(body["error"]["message"], "Unable to parse connector");

    let (status, body) = send(
        &t.app,
        Method::POST,
        "/Connectors",
        Some(r#"{"name":"x","module":"Unknown","settings":{}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["status"], "Bad Request");

    let (status, _) = send(&t.app, Method::POST, "/Connectors/missing/Start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = send(&t.app, Method::GET, "/Connectors", None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() {
    let t = test_app();
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
