//! Workflow log routes — history, live SSE stream, notifications.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use labtransit_runtime::{LogEntry, LogEvent, Notification};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::state::AppState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/log", get(get_log))
        .route("/log/stream", get(stream_log))
        .route("/notifications", get(get_notifications))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    since: u64,
}

async fn get_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<LogEntry>> {
    Json(state.orchestrator.log().entries_since(query.since))
}

async fn get_notifications(State(state): State<Arc<AppState>>) -> Json<Vec<Notification>> {
    Json(state.orchestrator.log().notifications())
}

async fn stream_log(State(state): State<Arc<AppState>>) -> Sse<KeepAliveStream<SseStream>> {
    let mut rx = state.orchestrator.log().subscribe();

    let stream: SseStream = Box::pin(async_stream::stream! {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Log stream subscriber lagged, {} events skipped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let name = match &event {
                LogEvent::Entry(_) => "entry",
                LogEvent::Notification(_) => "notification",
            };
            match Event::default().event(name).json_data(&event) {
                Ok(sse) => yield Ok::<_, Infallible>(sse),
                Err(e) => warn!("Dropping unserializable log event: {}", e),
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
