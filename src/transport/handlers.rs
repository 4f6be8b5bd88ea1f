use super::HandlerSlot;
use super::protocol::{WorkerRpcRequest, WorkerRpcResponse};

use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

pub async fn handle_worker_rpc(
    Extension(slot): Extension<Arc<HandlerSlot>>,
    Json(req): Json<WorkerRpcRequest>,
) -> (StatusCode, Json<WorkerRpcResponse>) {
    let Some(handler) = slot.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WorkerRpcResponse::error("Grid not bound to transport")),
        );
    };

    let name = req.request.name();
    tracing::trace!("Worker RPC {} from {}", name, req.from);

    match handler.on_request(req.from, req.request).await {
        Ok(response) => (StatusCode::OK, Json(WorkerRpcResponse::ok(response))),
        Err(e) => {
            tracing::warn!("Worker RPC {} failed: {:#}", name, e);
            (
                StatusCode::OK,
                Json(WorkerRpcResponse::error(format!("{:#}", e))),
            )
        }
    }
}
