//! HTTP API for master and secondary nodes.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relog_repl::{HealthStatus, Master, Secondary};
use serde::{Deserialize, Serialize};

/// Body of `GET /get_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataResponse {
    /// Stored records in sequence order.
    pub messages: Vec<String>,
}

/// Query string of `POST /append_data`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendParams {
    /// Record to append.
    pub data: String,
    /// Nodes (master included) that must hold the record; defaults to all.
    pub write_concern: Option<usize>,
}

/// Routes served by a master node.
pub fn master_router(master: Arc<Master>) -> Router {
    Router::new()
        .route("/get_data", get(master_get_data))
        .route("/append_data", post(append_data))
        .route("/health", get(health))
        .with_state(master)
}

/// Routes served by a secondary node.
pub fn secondary_router(secondary: Arc<Secondary>) -> Router {
    Router::new()
        .route("/get_data", get(secondary_get_data))
        .with_state(secondary)
}

/// Serve `router` on `addr` until `shutdown` resolves.
pub async fn serve<F>(router: Router, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn master_get_data(State(master): State<Arc<Master>>) -> Json<DataResponse> {
    Json(DataResponse {
        messages: master.get_data(),
    })
}

async fn append_data(
    State(master): State<Arc<Master>>,
    Query(params): Query<AppendParams>,
) -> Response {
    let write_concern = params
        .write_concern
        .unwrap_or_else(|| master.max_write_concern());

    match master.try_append(params.data.clone(), write_concern).await {
        Ok(sequence) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": format!("Appending data '{}' has succeeded.", params.data),
                "sequence": sequence,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(write_concern, error = %e, "append_data request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health(State(master): State<Arc<Master>>) -> Json<BTreeMap<String, HealthStatus>> {
    Json(master.health_snapshot())
}

async fn secondary_get_data(State(secondary): State<Arc<Secondary>>) -> Json<DataResponse> {
    Json(DataResponse {
        messages: secondary.get_data(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use relog_repl::MasterConfig;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_data_empty() {
        let master = Arc::new(Master::start(MasterConfig::default()));
        let router = master_router(master.clone());

        let request = Request::builder().uri("/get_data").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let data: DataResponse = serde_json::from_slice(&body).unwrap();
        assert!(data.messages.is_empty());
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_requires_data() {
        let master = Arc::new(Master::start(MasterConfig::default()));
        let router = master_router(master.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/append_data")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        master.shutdown().await;
    }
}
