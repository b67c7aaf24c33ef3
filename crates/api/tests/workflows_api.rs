//! Integration tests for `GET /api/v1/workflows`.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use common::{body_json, get, FakeBackend};

#[tokio::test]
async fn lists_json_templates_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["zebra.json", "fox.json", "README.md"] {
        std::fs::write(dir.path().join(name), "{}").unwrap();
    }
    let app = common::build_test_app(dir.path(), Arc::new(FakeBackend::default()));

    let response = get(app, "/api/v1/workflows").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["workflows"], serde_json::json!(["fox.json", "zebra.json"]));
}

#[tokio::test]
async fn empty_directory_lists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(dir.path(), Arc::new(FakeBackend::default()));

    let json = body_json(get(app, "/api/v1/workflows").await).await;
    assert_eq!(json["data"]["workflows"], serde_json::json!([]));
}

#[tokio::test]
async fn missing_directory_is_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone");
    let app = common::build_test_app(&missing, Arc::new(FakeBackend::default()));

    let response = get(app, "/api/v1/workflows").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INTERNAL_ERROR");
}
