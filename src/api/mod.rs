//! HTTP surface over a [`NetworkManager`].

mod error;
mod rest;
mod types;

pub use error::{ApiError, ApiResult};
pub use rest::RestApi;
pub use types::*;

use crate::manager::NetworkManager;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the REST server for a running node
pub fn create_api_server(manager: Arc<NetworkManager>) -> Router {
    let rest_api = RestApi::new(manager);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(rest_api.router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
