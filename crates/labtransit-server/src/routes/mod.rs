//! HTTP route handlers for the transport dashboard.

pub mod log;
pub mod microscopes;
pub mod slots;
pub mod transport;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use labtransit_core::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(slots::routes())
        .merge(microscopes::routes())
        .merge(transport::routes())
        .merge(log::routes())
}

/// Library error rendered as `{ "error": ... }` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::GuardBusy(_) => StatusCode::CONFLICT,
            Error::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DeviceCall(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use labtransit_core::{DeviceError, LabTransitConfig, TransportConfig};
    use tower::ServiceExt;

    use super::*;

    async fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let config = LabTransitConfig {
            port: 0,
            config_dir: dir.path().to_path_buf(),
            transport: TransportConfig::default(),
        };
        let state = Arc::new(AppState::new(config));
        state.orchestrator.refresh_slots().await.unwrap();
        state
    }

    async fn send(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn wait_idle(state: &Arc<AppState>) {
        for _ in 0..200 {
            if !state.orchestrator.guard().is_held() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation did not finish");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::GuardBusy("x".into()), StatusCode::CONFLICT),
            (Error::Precondition("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                Error::DeviceCall(DeviceError::rejected("arm", "connect", "down")),
                StatusCode::BAD_GATEWAY,
            ),
            (Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).status(), status);
        }
    }

    #[tokio::test]
    async fn test_list_slots() {
        let state = test_state().await;
        let (status, json) = send(&state, "GET", "/api/slots", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["slots"].as_array().unwrap().len(), 6);
        assert_eq!(json["slots"][0]["slotNumber"], 1);
        assert_eq!(json["slots"][0]["location"]["kind"], "incubatorSlot");
        assert_eq!(json["operationInFlight"], false);
    }

    #[tokio::test]
    async fn test_load_runs_in_background() {
        let state = test_state().await;
        let (status, json) = send(
            &state,
            "POST",
            "/api/transport/load",
            Some(serde_json::json!({ "slot": 1, "microscopeId": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["operationId"].is_string());

        wait_idle(&state).await;
        let (_, json) = send(&state, "GET", "/api/slots", None).await;
        assert_eq!(json["slots"][0]["location"]["kind"], "microscope");
        assert_eq!(json["slots"][0]["location"]["microscopeId"], 1);

        let (_, notifications) = send(&state, "GET", "/api/notifications", None).await;
        assert_eq!(notifications[0]["kind"], "success");
    }

    #[tokio::test]
    async fn test_empty_slot_is_unprocessable() {
        let state = test_state().await;
        let (status, json) = send(
            &state,
            "POST",
            "/api/transport/load",
            Some(serde_json::json!({ "slot": 4, "microscopeId": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("no sample"));
    }

    #[tokio::test]
    async fn test_second_request_conflicts() {
        let state = test_state().await;
        state
            .rig
            .arm
            .faults
            .delay("connect", Duration::from_millis(100));

        let (status, _) = send(
            &state,
            "POST",
            "/api/transport/load",
            Some(serde_json::json!({ "slot": 1, "microscopeId": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = send(
            &state,
            "POST",
            "/api/transport/load",
            Some(serde_json::json!({ "slot": 2, "microscopeId": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, current) = send(&state, "GET", "/api/transport/current", None).await;
        assert_eq!(current["operation"]["kind"], "load");
        assert_eq!(current["operation"]["target"]["id"], 1);

        wait_idle(&state).await;
        let (_, current) = send(&state, "GET", "/api/transport/current", None).await;
        assert!(current["operation"].is_null());
    }

    #[tokio::test]
    async fn test_selectable() {
        let state = test_state().await;
        let (status, json) = send(&state, "GET", "/api/microscopes/1/selectable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["slots"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["intent"], "load");

        let (status, _) = send(&state, "GET", "/api/microscopes/7/selectable", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_virtual_binding() {
        let state = test_state().await;
        let (status, _) = send(
            &state,
            "POST",
            "/api/transport/virtual/load",
            Some(serde_json::json!({ "microscopeId": 99, "specimenId": "organoid-z" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_idle(&state).await;

        let (_, microscopes) = send(&state, "GET", "/api/microscopes", None).await;
        let virtual_entry = microscopes
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["id"] == 99)
            .unwrap()
            .clone();
        assert_eq!(virtual_entry["boundSpecimen"]["id"], "organoid-z");
    }

    #[tokio::test]
    async fn test_microscope_status() {
        let state = test_state().await;
        let (status, json) = send(&state, "GET", "/api/microscopes/1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stage"], "working");

        let (status, _) = send(&state, "GET", "/api/microscopes/7/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.rig.microscopes[&1]
            .faults
            .fail_on("get_status", "offline");
        let (status, _) = send(&state, "GET", "/api/microscopes/1/status", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_log_since() {
        let state = test_state().await;
        let (_, all) = send(&state, "GET", "/api/log", None).await;
        let total = all.as_array().unwrap().len();
        assert!(total >= 1);

        let uri = format!("/api/log?since={}", total);
        let (_, tail) = send(&state, "GET", &uri, None).await;
        assert!(tail.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_stream_delivers_entries() {
        use futures::StreamExt;

        let state = test_state().await;
        let request = Request::builder()
            .uri("/api/log/stream")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        state.orchestrator.log().info(None, "Refreshed 6 slots from the incubator");
        let mut body = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(1), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("event: entry"));
        assert!(text.contains("Refreshed 6 slots"));
    }

    #[tokio::test]
    async fn test_correct_location() {
        let state = test_state().await;
        let (status, json) = send(
            &state,
            "POST",
            "/api/slots/2/location",
            Some(serde_json::json!({ "location": { "kind": "incubatorStation" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["previous"]["kind"], "incubatorSlot");
        assert_eq!(
            state.orchestrator.registry().get(2).unwrap(),
            labtransit_core::Location::IncubatorStation
        );
    }
}
