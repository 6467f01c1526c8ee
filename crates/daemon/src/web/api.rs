//! REST endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::board::{BoardError, NewTicket, TicketPatch, TicketStatus};

use super::AppState;

type ApiError = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn board_error(e: BoardError) -> ApiError {
    match e {
        BoardError::TicketNotFound(_) => error(StatusCode::NOT_FOUND, e.to_string()),
        BoardError::UncommittedChanges(_) => error(StatusCode::CONFLICT, e.to_string()),
    }
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.broker.registry().list_running().len(),
    }))
}

/// GET /api/board
pub async fn get_board(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.broker.board().snapshot()))
}

/// GET /api/tickets
pub async fn list_tickets(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.broker.board().snapshot().tickets))
}

/// POST /api/tickets
pub async fn create_ticket(
    State(state): State<AppState>,
    Json(body): Json<NewTicket>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.title.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    let ticket = state.broker.board().create_ticket(body);
    Ok((StatusCode::CREATED, Json(json!(ticket))))
}

/// GET /api/tickets/:id
pub async fn get_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .broker
        .board()
        .ticket(&id)
        .map(|t| Json(json!(t)))
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("ticket not found: {id}")))
}

/// PATCH /api/tickets/:id
pub async fn update_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TicketPatch>,
) -> Result<Json<Value>, ApiError> {
    state
        .broker
        .board()
        .update_ticket(&id, patch)
        .map(|t| Json(json!(t)))
        .map_err(board_error)
}

#[derive(Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    force: bool,
}

/// DELETE /api/tickets/:id?force=true
pub async fn delete_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    state
        .broker
        .board()
        .delete_ticket(&id, params.force)
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(board_error)
}

#[derive(Deserialize)]
pub struct MoveBody {
    status: TicketStatus,
}

/// POST /api/tickets/:id/move
pub async fn move_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .broker
        .board()
        .move_ticket(&id, body.status)
        .map(|t| Json(json!(t)))
        .map_err(board_error)
}
