use std::sync::Arc;

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use pyroom_core::SessionManager;
use tracing::{debug, info};

use crate::api::{ConversationForm, MessageResponse, RunRequest, RunResponse, SessionsResponse};
use crate::error::ApiError;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/run", post(run))
        .route("/reset", post(reset))
        .route("/end_session", post(end_session))
        .route("/sessions", get(list_sessions))
        .with_state(manager)
}

async fn run(
    State(manager): State<Arc<SessionManager>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> ApiResult<RunResponse> {
    let Json(request) = payload?;
    let dependencies = request.dependencies.unwrap_or_default();
    debug!(
        conversation_id = %request.conversation_id,
        dependencies = dependencies.len(),
        "Received run request"
    );

    let output = manager
        .run(&request.conversation_id, &request.code, &dependencies)
        .await?;
    Ok(Json(RunResponse { output }))
}

async fn reset(
    State(manager): State<Arc<SessionManager>>,
    form: Result<Form<ConversationForm>, FormRejection>,
) -> ApiResult<MessageResponse> {
    let Form(ConversationForm { conversation_id }) = form?;
    info!(conversation_id = %conversation_id, "Reset requested");

    manager.reset(&conversation_id).await?;
    Ok(Json(MessageResponse {
        message: format!("Kernel for session '{conversation_id}' reset successful"),
    }))
}

async fn end_session(
    State(manager): State<Arc<SessionManager>>,
    form: Result<Form<ConversationForm>, FormRejection>,
) -> ApiResult<MessageResponse> {
    let Form(ConversationForm { conversation_id }) = form?;
    info!(conversation_id = %conversation_id, "End of session requested");

    manager.end_session(&conversation_id).await?;
    Ok(Json(MessageResponse {
        message: format!("Session '{conversation_id}' ended successfully and cleanup initiated."),
    }))
}

async fn list_sessions(State(manager): State<Arc<SessionManager>>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: manager.list_sessions().await,
    })
}
