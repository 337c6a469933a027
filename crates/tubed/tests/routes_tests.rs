//! Endpoint tests driven through the router without a socket

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use tube_common::LearningState;
use tubed::{build_router, AppState, Catalog};

fn app() -> axum::Router {
    build_router(Arc::new(AppState::new(Catalog::generated())))
}

fn state(user: &str, last_updated: i64) -> LearningState {
    let threads = vec!["t1".to_string(), "t2".to_string(), "t3".to_string()];
    let mut state = LearningState::with_threads(user, &threads, 5, 3);
    state.last_updated = last_updated;
    state
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_get_user_state_requires_user_id() {
    let (status, body) = send(&app(), get("/user-state")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_unknown_user_is_not_found() {
    let (status, _) = send(&app(), get("/user-state?userId=nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_saved_state_is_returned() {
    let app = app();
    let saved = state("learner", 100);
    let (status, body) = send(&app, post_json("/user-state", json!({ "state": saved }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send(&app, get("/user-state?userId=learner")).await;
    assert_eq!(status, StatusCode::OK);
    let fetched: LearningState = serde_json::from_value(body["state"].clone()).unwrap();
    assert_eq!(fetched, saved);
}

#[tokio::test]
async fn test_older_write_is_acknowledged_but_ignored() {
    let app = app();
    send(&app, post_json("/user-state", json!({ "state": state("learner", 200) }))).await;
    let (status, body) = send(&app, post_json("/user-state", json!({ "state": state("learner", 150) }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = send(&app, get("/user-state?userId=learner")).await;
    assert_eq!(body["state"]["lastUpdated"], 200);
}

#[tokio::test]
async fn test_anonymous_save_carries_id() {
    let app = app();
    let (status, _) = send(
        &app,
        post_json(
            "/user-state",
            json!({ "state": state("anon-1234", 10), "id": "anon-1234" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, get("/user-state?userId=anon-1234")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stitch_lookup() {
    let app = app();
    let (status, body) = send(&app, get("/content/stitch/t2-0003")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stitch"]["id"], "t2-0003");
    assert_eq!(body["stitch"]["threadId"], "t2");

    let (status, _) = send(&app, get("/content/stitch/garbage")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_batch_omits_unknown_ids() {
    let (status, body) = send(
        &app(),
        post_json(
            "/content/batch",
            json!({ "stitchIds": ["t1-0001", "bogus", "t1-0002"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["stitches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["t1-0001", "t1-0002"]);
}

#[tokio::test]
async fn test_health_reports_counts() {
    let app = app();
    send(&app, post_json("/user-state", json!({ "state": state("a", 1) }))).await;
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["users"], 1);
}
