//! Transport routes — start Load/Unload and report the in-flight operation.
//!
//! Starting returns 202 once preconditions pass and the guard is taken; the
//! device sequence continues in a background task and reports through the
//! workflow log.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use labtransit_core::{MicroscopeId, SlotNumber};
use labtransit_runtime::PendingTransport;
use serde::Deserialize;
use tracing::{info, warn};

use super::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/transport/load", post(load))
        .route("/transport/unload", post(unload))
        .route("/transport/virtual/load", post(virtual_load))
        .route("/transport/virtual/unload", post(virtual_unload))
        .route("/transport/current", get(get_current))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransportRequest {
    slot: SlotNumber,
    microscope_id: MicroscopeId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualLoadRequest {
    microscope_id: MicroscopeId,
    specimen_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualUnloadRequest {
    microscope_id: MicroscopeId,
}

type Accepted = (StatusCode, Json<serde_json::Value>);

/// Run the operation in the background and answer 202.
fn spawn(pending: PendingTransport) -> Accepted {
    let operation_id = pending.operation_id();
    let kind = pending.kind();
    let target = pending.target();

    tokio::spawn(async move {
        let outcome = pending.run().await;
        if outcome.succeeded() {
            info!("Operation {} finished", outcome.operation_id);
        } else {
            warn!(
                "Operation {} failed in {:?}",
                outcome.operation_id, outcome.last_state
            );
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "operationId": operation_id,
            "kind": kind,
            "target": target,
            "status": "pending",
        })),
    )
}

async fn load(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransportRequest>,
) -> ApiResult<Accepted> {
    let pending = state
        .orchestrator
        .prepare_load(req.slot, req.microscope_id)
        .await?;
    Ok(spawn(pending))
}

async fn unload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransportRequest>,
) -> ApiResult<Accepted> {
    let pending = state
        .orchestrator
        .prepare_unload(req.slot, req.microscope_id)
        .await?;
    Ok(spawn(pending))
}

async fn virtual_load(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VirtualLoadRequest>,
) -> ApiResult<Accepted> {
    let pending = state
        .orchestrator
        .prepare_virtual_load(req.microscope_id, &req.specimen_id)
        .await?;
    Ok(spawn(pending))
}

async fn virtual_unload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VirtualUnloadRequest>,
) -> ApiResult<Accepted> {
    let pending = state
        .orchestrator
        .prepare_virtual_unload(req.microscope_id)
        .await?;
    Ok(spawn(pending))
}

async fn get_current(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    Json(serde_json::json!({
        "operation": orchestrator.current_operation(),
        "holder": orchestrator.guard().holder(),
    }))
}
