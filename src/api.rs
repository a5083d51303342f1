//! Administrative HTTP endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::service::RemoteStorage;

/// Error body returned by the admin endpoints
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: &'static str,
}

impl ApiError {
    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "Method not allowed".to_string(),
            code: "HTTP001",
        }
    }

    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
            code: "HTTP002",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "message": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Routes for `/remount` and `/stats`
pub fn router(storage: Arc<RemoteStorage>) -> Router {
    Router::new()
        .route("/remount", get(remount).fallback(method_not_allowed))
        .route("/stats", get(stats).fallback(method_not_allowed))
        .with_state(storage)
}

/// Serve the admin endpoints until the listener fails
pub async fn serve(listen: SocketAddr, storage: Arc<RemoteStorage>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Admin API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(storage)).await
}

async fn remount(State(storage): State<Arc<RemoteStorage>>) -> impl IntoResponse {
    info!("Remount requested");
    tokio::spawn(async move {
        let _ = storage.restart_cycle().await;
    });
    Json(json!({ "status": "OK" }))
}

async fn stats(State(storage): State<Arc<RemoteStorage>>) -> Result<Json<serde_json::Value>, ApiError> {
    match storage.stats().await {
        Ok(stats) => Ok(Json(json!({ "status": "OK", "data": stats }))),
        Err(e) => {
            error!("Error getting engine stats: {}", e);
            Err(ApiError::engine_unavailable(e.to_string()))
        }
    }
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}
