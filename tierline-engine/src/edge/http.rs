use super::{CallReply, EdgeState};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tierline_client::Continuation;
use tokio::sync::oneshot;

use crate::protocol::NewUser;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pending_calls: usize,
    subscribers: usize,
}

pub(super) fn router(state: Arc<EdgeState>) -> Router {
    Router::new()
        .route("/api/users", get(list_users).post(create_user))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<EdgeState>>) -> Response {
    let payload = HealthResponse {
        status: "ok",
        pending_calls: state.pending.len(),
        subscribers: state.subscribers.len(),
    };
    (StatusCode::OK, Json(payload)).into_response()
}

async fn list_users(State(state): State<Arc<EdgeState>>) -> Response {
    let (tx, rx) = oneshot::channel();
    state.get_users(Continuation::RespondHttp(tx));

    let users = match await_reply(rx).await.and_then(CallReply::into_users) {
        Ok(users) => users,
        Err(error) => return response_error(StatusCode::INTERNAL_SERVER_ERROR, error),
    };
    (StatusCode::OK, Json(users)).into_response()
}

async fn create_user(
    State(state): State<Arc<EdgeState>>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Response {
    let user = match body {
        Ok(Json(user)) => user,
        Err(rejection) => return response_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if let Err(reason) = user.validate() {
        return response_error(StatusCode::BAD_REQUEST, reason);
    }

    let (tx, rx) = oneshot::channel();
    state.create_user(user, Continuation::RespondHttp(tx));

    let created = match await_reply(rx).await.and_then(CallReply::into_user) {
        Ok(created) => created,
        Err(error) => return response_error(StatusCode::INTERNAL_SERVER_ERROR, error),
    };
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn await_reply(rx: oneshot::Receiver<CallReply>) -> Result<CallReply, String> {
    rx.await
        .map_err(|_| "request abandoned before a reply arrived".to_string())
}

fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}
