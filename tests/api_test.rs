mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use common::{config, payload, Cluster, KIB};
use megaswarm::api::create_api_server;
use megaswarm::chunk::FileId;

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health() {
    let cluster = Cluster::with_peers(1, |name| config(name, 4 * KIB));
    let app = create_api_server(cluster.origin().manager.clone());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"OK");
}

#[tokio::test]
async fn test_submit_then_download() {
    let cluster = Cluster::with_peers(3, |name| config(name, 4 * KIB));
    let app = create_api_server(cluster.origin().manager.clone());
    let data = payload(10 * KIB as usize);

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/v1/files?name=notes.txt")
                .body(Body::from(data.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["total_chunks"], 3);
    assert_eq!(json["name"], "notes.txt");
    let file_id = json["file_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, data);

    let response = app
        .oneshot(Request::get("/api/v1/hosting").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["available_chunks"], 3);
}

#[tokio::test]
async fn test_error_statuses() {
    let cluster = Cluster::with_peers(2, |name| config(name, 4 * KIB));
    let app = create_api_server(cluster.origin().manager.clone());

    let response = app
        .clone()
        .oneshot(Request::post("/api/v1/files").body(Body::from("x")).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/files/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::get(format!("/api/v1/files/{}", FileId::new()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_peers_stats_and_maintenance() {
    let cluster = Cluster::with_peers(3, |name| config(name, 4 * KIB));
    let app = create_api_server(cluster.origin().manager.clone());

    let response = app
        .clone()
        .oneshot(Request::get("/api/v1/peers").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let peers = body_json(response).await;
    assert_eq!(peers.as_array().unwrap().len(), 3);
    assert_eq!(peers[0]["id"].as_str().unwrap().len(), 64);

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/v1/maintenance")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["peers_responded"], 3);

    let response = app
        .oneshot(Request::get("/api/v1/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["peer_count"], 3);
    assert_eq!(stats["hosted_file_count"], 0);
}
