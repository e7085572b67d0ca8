//! HTTP handlers for the scanner endpoint

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use scanbridge_scan::{dispatch, CommandEnvelope};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::AppState;

/// Error body for requests that never reach the scanner
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ErrorBody {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// Device identity
pub async fn get_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scanner.info())
}

/// Current session snapshot, for observers that do not hold the session
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.scanner.subscribe().borrow().clone();
    Json(snapshot)
}

/// Run one session command. Command failures travel inside the response
/// envelope; only an unreadable body is an HTTP error.
pub async fn post_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CommandEnvelope>, JsonRejection>,
) -> impl IntoResponse {
    let Json(command) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected malformed command");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(rejection.body_text())),
            )
                .into_response();
        }
    };

    debug!(method = %command.method, command_id = %command.command_id, "Session command");
    let response = dispatch(state.scanner.as_ref(), command).await;
    Json(response).into_response()
}
