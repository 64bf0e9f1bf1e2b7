#![allow(missing_docs)]

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use dataslot::server::{build_router, AppState};
use dataslot::ServiceConfig;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

const BOUNDARY: &str = "dataslot-test-boundary";
const LEFT: &[u8] = b"id,a\n1,10\n2,20\n3,30\n";
const RIGHT: &[u8] = b"id,b\n1,100\n3,300\n4,400\n";

fn app() -> (TempDir, Router) {
    let dir = tempdir().expect("tempdir");
    let config = ServiceConfig::with_data_dir(dir.path());
    let state = AppState::open(&config).expect("open state");
    (dir, build_router(state))
}

fn multipart(field: &str, file_name: &str, bytes: &[u8]) -> Body {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn upload(app: &Router, path: &str, file_name: &str, bytes: &[u8]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart("file", file_name, bytes))
        .expect("request");
    send(app, request).await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).expect("request");
    send(app, request).await
}

async fn delete(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    send(app, request).await
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request");
    send(app, request).await
}

#[tokio::test]
async fn health_reports_ok() {
    let (_dir, app) = app();
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn workspace_round_trip() {
    let (_dir, app) = app();

    let (status, left) = upload(&app, "/multifile/upload", "left.csv", LEFT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(left["already_present"], json!(false));
    assert_eq!(left["slot_count"], json!(1));
    assert_eq!(left["display_name"], json!("left.csv"));
    let left_id = left["dataset_id"].as_str().unwrap().to_string();

    let (_, again) = upload(&app, "/multifile/upload", "left.csv", LEFT).await;
    assert_eq!(again["already_present"], json!(true));
    assert_eq!(again["dataset_id"], json!(left_id));

    let (_, right) = upload(&app, "/multifile/upload", "right.csv", RIGHT).await;
    assert_eq!(right["slot_count"], json!(2));

    let (status, current) = get(&app, "/multifile/current").await;
    assert_eq!(status, StatusCode::OK);
    let datasets = current["datasets"].as_array().unwrap();
    assert_eq!(datasets.len(), 2);
    assert_eq!(datasets[0]["dataset_id"], json!(left_id));
    assert_eq!(datasets[0]["n_rows"], json!(3));

    let (status, chunk) = get(
        &app,
        &format!("/multifile/chunk?dataset_id={left_id}&row_start=1&n_rows=5&n_cols=1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chunk["columns"], json!(["id"]));
    assert_eq!(chunk["rows"], json!([[2], [3]]));
    assert_eq!(chunk["n_rows"], json!(2));
    assert_eq!(chunk["total_cols"], json!(2));

    let (status, grid) = post_json(
        &app,
        "/multifile/ops",
        json!({"steps": [
            {"op": "source", "table": "t1"},
            {"op": "merge", "right_table": "t2", "how": "inner", "left_on": ["id"], "right_on": ["id"]},
            {"op": "sort", "by": ["id"]}
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        grid,
        json!({
            "columns": ["id", "a", "b"],
            "rows": [[1, 10, 100], [3, 30, 300]],
            "truncated": false,
            "note": null
        })
    );

    let (status, grid) = post_json(
        &app,
        "/multifile/sql",
        json!({"query": "SELECT a FROM t1 ORDER BY a", "max_rows": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grid["rows"], json!([[10], [20]]));
    assert_eq!(grid["truncated"], json!(true));

    let (status, removed) = delete(&app, &format!("/multifile/current/{left_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed, json!({"ok": true, "slot_count": 1}));

    let (status, cleared) = delete(&app, "/multifile/current").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared, json!({"ok": true, "slot_count": 0}));

    let (status, err) = post_json(&app, "/multifile/sql", json!({"query": "SELECT 1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["detail"]["code"], json!("NO_DATASETS"));
}

#[tokio::test]
async fn errors_use_the_detail_envelope() {
    let (_dir, app) = app();

    let (status, body) = upload(&app, "/multifile/upload", "notes.txt", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("BAD_EXTENSION"));
    assert!(body["detail"]["detail"].as_str().unwrap().contains("notes.txt"));

    let (status, body) = get(&app, "/multifile/chunk?dataset_id=0123456789abcdef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"]["code"], json!("DATASET_NOT_FOUND"));

    let (status, body) = delete(&app, "/multifile/current/0123456789abcdef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"]["code"], json!("DATASET_NOT_FOUND"));

    upload(&app, "/multifile/upload", "left.csv", LEFT).await;
    let (status, body) = post_json(
        &app,
        "/multifile/ops",
        json!({"steps": [
            {"op": "source", "table": "t1"},
            {"op": "filter", "conditions": [{"column": "nope", "cmp": ">", "value": 1}]}
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("OPS_VALIDATION_ERROR"));
    assert_eq!(
        body["detail"]["detail"],
        json!("step 1 (filter): unknown column 'nope'")
    );

    let (status, body) = post_json(&app, "/multifile/sql", json!({"query": "DROP TABLE t1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("BAD_SQL"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/multifile/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart("attachment", "left.csv", LEFT))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("BAD_UPLOAD"));
}

#[tokio::test]
async fn single_store_upload_and_lookup() {
    let (_dir, app) = app();

    let (status, stored) = upload(&app, "/upload", "left.csv", LEFT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["columns"], json!(["id", "a"]));
    assert_eq!(stored["sample"][0], json!({"id": 1, "a": 10}));
    let id = stored["dataset_id"].as_str().unwrap().to_string();

    let (_, other) = upload(&app, "/upload", "left.csv", RIGHT).await;
    assert_eq!(other["display_name"], json!("left (1).csv"));

    let (status, summary) = get(&app, &format!("/datasets/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["n_rows"], json!(3));
    assert!(summary.get("sample").is_none());

    let (status, _) = get(&app, "/datasets/not-a-dataset").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_query_bodies_use_the_detail_envelope() {
    let (_dir, app) = app();

    let (status, body) = post_json(&app, "/multifile/ops", json!({"steps": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("OPS_VALIDATION_ERROR"));
    assert!(body["detail"]["detail"].is_string());

    let (status, body) = post_json(&app, "/multifile/sql", json!({"query": 7})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("BAD_SQL"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/multifile/sql")
        .body(Body::from("SELECT 1"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], json!("BAD_SQL"));
}
