//! Slot routes — registry snapshot, incubator refresh, operator correction.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use labtransit_core::{Location, SlotNumber};
use serde::Deserialize;
use tracing::info;

use super::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/slots", get(list_slots))
        .route("/slots/refresh", post(refresh_slots))
        .route("/slots/{slot}/location", post(correct_location))
}

async fn list_slots(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    Json(serde_json::json!({
        "slots": orchestrator.registry().snapshot(),
        "operationInFlight": orchestrator.guard().is_held(),
    }))
}

async fn refresh_slots(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let count = state.orchestrator.refresh_slots().await?;
    Ok(Json(serde_json::json!({ "refreshed": count })))
}

#[derive(Debug, Deserialize)]
struct CorrectionRequest {
    location: Location,
}

async fn correct_location(
    State(state): State<Arc<AppState>>,
    Path(slot): Path<SlotNumber>,
    Json(req): Json<CorrectionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    info!("Location correction requested for slot {}", slot);
    let previous = state
        .orchestrator
        .correct_location(slot, req.location)
        .await?;
    Ok(Json(serde_json::json!({
        "slot": slot,
        "previous": previous,
        "location": req.location,
    })))
}
