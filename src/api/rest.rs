use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::manager::{HostingStatus, NetworkManager, NetworkStats};
use crate::metrics::metrics_route;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

pub struct RestApi {
    manager: Arc<NetworkManager>,
}

impl RestApi {
    pub fn new(manager: Arc<NetworkManager>) -> Self {
        Self { manager }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", metrics_route())
            .route("/api/v1/files", post(submit_file))
            .route("/api/v1/files/:id", get(retrieve_file))
            .route("/api/v1/stats", get(network_stats))
            .route("/api/v1/peers", get(list_peers))
            .route("/api/v1/hosting", get(hosting_status))
            .route("/api/v1/maintenance", post(run_maintenance))
            // Uploads are whole files, not form posts.
            .layer(DefaultBodyLimit::disable())
            .with_state(self.manager.clone())
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn submit_file(
    State(manager): State<Arc<NetworkManager>>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<DistributionResponse>)> {
    let name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("name query parameter is required".to_string()))?;

    let result = manager.submit_file(body, &name).await?;
    let status = if result.success {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(DistributionResponse::from(&result))))
}

async fn retrieve_file(
    State(manager): State<Arc<NetworkManager>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let data = manager.retrieve_by_reference(&id).await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

async fn network_stats(State(manager): State<Arc<NetworkManager>>) -> Json<NetworkStats> {
    Json(manager.network_stats())
}

async fn list_peers(State(manager): State<Arc<NetworkManager>>) -> Json<Vec<PeerSummary>> {
    Json(manager.peers().iter().map(PeerSummary::from).collect())
}

async fn hosting_status(State(manager): State<Arc<NetworkManager>>) -> Json<Vec<HostingStatus>> {
    Json(manager.hosting_status().await)
}

async fn run_maintenance(
    State(manager): State<Arc<NetworkManager>>,
) -> ApiResult<Json<MaintenanceResponse>> {
    let report = manager.run_maintenance().await?;
    Ok(Json(report.into()))
}
