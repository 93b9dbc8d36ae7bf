//! HTTP routes and handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use lifestream_core::{normalize_url, subject_id_for_url, Subject};
use lifestream_events::{source, EventKind, LinkAdded, NewEvent};
use lifestream_infra::admin;
use lifestream_infra::EventLedger;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/links", post(add_link))
        .route("/events/recent", get(recent_events))
        .with_state(state)
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct AddLinkRequest {
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// POST /links
///
/// Accepts `{url, source?}`, answers `{success, subject_id, url_norm}`.
///
/// The handler only normalizes, derives the subject id, and appends the
/// fact. The link row itself is the materializer's to write; capture is
/// acknowledged as soon as the event is durable in the ledger.
async fn add_link(
    State(state): State<AppState>,
    Json(request): Json<AddLinkRequest>,
) -> Response {
    let url = request.url.trim().to_string();
    if url.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "invalid_url", "url must not be empty");
    }

    let url_norm = normalize_url(&url);
    let subject_id = subject_id_for_url(&url);
    let event_source = request.source.unwrap_or_else(|| source::API.to_string());

    let event = NewEvent::new(
        event_source,
        Subject::link(subject_id.clone()),
        EventKind::LinkAdded(LinkAdded {
            url: url.clone(),
            url_norm: Some(url_norm.clone()),
        }),
    );
    if let Err(err) = state.ledger.append(event).await {
        error!(subject_id = %subject_id, error = %err, "link.added append failed");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "capture_failed", err.to_string());
    }

    info!(subject_id = %subject_id, url_norm = %url_norm, "link captured");
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "subject_id": subject_id,
            "url_norm": url_norm,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RecentEventsQuery {
    pub limit: Option<u32>,
}

/// GET /events/recent?limit=50
///
/// Read-only event listing for operator visibility.
async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentEventsQuery>,
) -> Response {
    match admin::recent_events(&state.pool, query.limit.unwrap_or(50)).await {
        Ok(events) => (StatusCode::OK, Json(serde_json::json!({ "events": events })))
            .into_response(),
        Err(err) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            format!("failed to query events: {err}"),
        ),
    }
}
