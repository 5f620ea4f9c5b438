use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use stylesearch::service::backend::{router, BackendState, SearchResponse};
use stylesearch::service::ErrorBody;

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Address that refuses connections.
async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn vector_service(body: Value) -> Router {
    Router::new().route(
        "/get_vector",
        post(move || {
            let body = body.clone();
            async move { Json(body) }
        }),
    )
}

fn search_service(status: StatusCode, body: &'static str) -> Router {
    Router::new().route(
        "/search",
        post(move |Json(request): Json<Value>| async move {
            assert!(request["vector"].is_array());
            (
                status,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body,
            )
        }),
    )
}

async fn backend(vector: SocketAddr, search: SocketAddr) -> SocketAddr {
    let state = BackendState::new(
        &format!("http://{vector}"),
        &format!("http://{search}"),
        Duration::from_secs(5),
    )
    .unwrap();
    spawn(router(state)).await
}

async fn post_search(addr: SocketAddr) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/search"))
        .json(&json!({"queryText": "black leather boots", "top_k": 2}))
        .send()
        .await
        .unwrap()
}

async fn detail(resp: reqwest::Response) -> String {
    resp.json::<ErrorBody>().await.unwrap().detail
}

#[tokio::test(flavor = "current_thread")]
async fn returns_items_for_matches() {
    let vector = spawn(vector_service(json!({"vector": [0.1, 0.2, 0.3]}))).await;
    let search = spawn(search_service(
        StatusCode::OK,
        r#"[{"rank": 1, "id": "women_boots image_4.jpg", "score": 0.93,
             "metadata": {"image_name": "Leather ankle boot", "brand": "Acme",
                          "gender": "Women", "item_type": "Shoes", "item_sub_type": "Boots",
                          "image_url": "https://cdn.test/4.jpg", "caption": "Edgy. Nights out. Leather. Smooth.",
                          "item_url": "https://shop.test/4"}}]"#,
    ))
    .await;
    let addr = backend(vector, search).await;

    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: SearchResponse = resp.json().await.unwrap();
    assert_eq!(body.description, "Search results for 'black leather boots'");
    assert_eq!(body.items.len(), 1);
    let item = &body.items[0];
    assert_eq!(item.item_name, "Leather ankle boot");
    assert_eq!(item.item_sub_type, "Boots");
    assert_eq!(item.item_caption, "Edgy. Nights out. Leather. Smooth.");
    assert_eq!(item.rank, json!(1));
}

#[tokio::test(flavor = "current_thread")]
async fn empty_matches_are_ok_with_no_items() {
    let vector = spawn(vector_service(json!({"vector": [0.1]}))).await;
    let search = spawn(search_service(StatusCode::OK, "[]")).await;
    let addr = backend(vector, search).await;

    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: SearchResponse = resp.json().await.unwrap();
    assert!(body.items.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn missing_vector_is_501() {
    let vector = spawn(vector_service(json!({"vector": []}))).await;
    let search = spawn(search_service(StatusCode::OK, "[]")).await;
    let addr = backend(vector, search).await;

    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_IMPLEMENTED);
    assert_eq!(
        detail(resp).await,
        "Value error: No vector returned from vector service."
    );
}

#[tokio::test(flavor = "current_thread")]
async fn unreachable_downstream_is_500() {
    let search = spawn(search_service(StatusCode::OK, "[]")).await;
    let addr = backend(closed_port().await, search).await;
    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(detail(resp).await.starts_with("Request error:"));

    let vector = spawn(vector_service(json!({"vector": [0.1]}))).await;
    let addr = backend(vector, closed_port().await).await;
    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test(flavor = "current_thread")]
async fn downstream_error_status_is_503() {
    let vector = spawn(vector_service(json!({"vector": [0.1]}))).await;
    let search = spawn(search_service(
        StatusCode::INTERNAL_SERVER_ERROR,
        r#"{"detail": "Error querying Pinecone: boom"}"#,
    ))
    .await;
    let addr = backend(vector, search).await;

    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert!(detail(resp).await.starts_with("Unexpected error:"));
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_payload_is_502() {
    let vector = spawn(vector_service(json!({"vector": [0.1]}))).await;
    let search = spawn(search_service(StatusCode::OK, r#"{"matches": "nope"}"#)).await;
    let addr = backend(vector, search).await;

    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(detail(resp).await.starts_with("Key error:"));
}

#[tokio::test(flavor = "current_thread")]
async fn non_json_body_is_501() {
    let vector = spawn(vector_service(json!({"vector": [0.1]}))).await;
    let search = spawn(search_service(StatusCode::OK, "<html>upstream proxy</html>")).await;
    let addr = backend(vector, search).await;

    let resp = post_search(addr).await;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_IMPLEMENTED);
    let detail = detail(resp).await;
    assert!(detail.starts_with("Value error: invalid JSON from"), "{detail}");
}

#[tokio::test(flavor = "current_thread")]
async fn health_reports_running() {
    let addr = backend(closed_port().await, closed_port().await).await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body,
        json!({"status": "ok", "message": "Backend service is running"})
    );
}
