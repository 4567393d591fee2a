// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for the dispatch HTTP surface: health, admission
//! conflict, and cancellation-of-unknown-job behaviour.

use agent_daemon::{AppState, build_app};
use agent_engine::Engine;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

fn sample_toml(base: &std::path::Path) -> String {
    format!(
        r#"
        [objectstore]
        endpoint = "127.0.0.1:9000"
        access_key = "key"
        secret_key = "secret"

        [renderer]
        host = "127.0.0.1"
        port = 8188

        [paths]
        base_models = "{models}"
        loras = "{loras}"
        workflows = "{workflows}"
        outputs = "{outputs}"
        temp = "{temp}"
        "#,
        models = base.join("models").display(),
        loras = base.join("loras").display(),
        workflows = base.join("workflows").display(),
        outputs = base.join("outputs").display(),
        temp = base.join("temp").display(),
    )
}

fn test_state(base: &std::path::Path) -> Arc<AppState> {
    let config = agent_config::parse_toml(&sample_toml(base)).unwrap();
    config.ensure_directories().unwrap();
    let engine = Engine::new(config).unwrap();
    Arc::new(AppState { engine: Arc::new(engine) })
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn healthz_reports_not_busy_when_idle() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let (status, json) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["busy"], false);
}

#[tokio::test]
async fn root_route_mirrors_healthz() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let (status, json) = get_json(app, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn submit_job_rejects_malformed_workflow_reference() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let body = serde_json::json!({
        "jobId": "job-1",
        "user": {"id": "u1", "username": "alice"},
        "workflow": {"id": "wf-1"},
        "baseModel": {"bucket": "models", "key": "sd15.safetensors"},
        "parameters": {"prompt": "a cat", "steps": 20, "cfgScale": 7.5, "resolution": {"width": 512, "height": 512}},
        "output": {"bucket": "outputs", "prefix": ""},
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn cancel_unknown_job_reports_not_cancelled() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs/does-not-exist/cancel")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"token": "whatever"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["cancelled"], false);
}
