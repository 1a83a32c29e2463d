//! Microscope routes — configured microscopes, live status, selectable specimens.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use labtransit_core::{Error, MicroscopeId, MicroscopeKind};
use labtransit_runtime::Selection;

use super::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/microscopes", get(list_microscopes))
        .route("/microscopes/{id}/status", get(get_status))
        .route("/microscopes/{id}/selectable", get(get_selectable))
}

async fn list_microscopes(State(state): State<Arc<AppState>>) -> Json<Vec<serde_json::Value>> {
    let orchestrator = &state.orchestrator;
    let microscopes = orchestrator
        .microscopes()
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "name": m.name,
                "kind": m.kind,
                "boundSlot": orchestrator.registry().bound_to(m.id),
                "boundSpecimen": orchestrator.virtual_binding(m.id),
            })
        })
        .collect();
    Json(microscopes)
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MicroscopeId>,
) -> ApiResult<Json<serde_json::Value>> {
    let orchestrator = &state.orchestrator;
    let config = orchestrator
        .microscope_config(id)
        .ok_or_else(|| Error::NotFound(format!("microscope {}", id)))?;

    match config.kind {
        MicroscopeKind::Physical => {
            let status = orchestrator.microscope_status(id).await?;
            Ok(Json(serde_json::to_value(status).map_err(Error::from)?))
        }
        MicroscopeKind::Virtual => Ok(Json(serde_json::json!({
            "microscopeId": id,
            "ready": true,
            "boundSpecimen": orchestrator.virtual_binding(id),
        }))),
    }
}

async fn get_selectable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MicroscopeId>,
) -> ApiResult<Json<Selection>> {
    Ok(Json(state.orchestrator.selection(id)?))
}
