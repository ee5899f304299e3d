use axum::Json;
use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pyroom_core::{Error as CoreError, InstallFailureKind};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{message}")]
    InvalidRequest { status: StatusCode, message: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(err) => core_status(err),
            ApiError::InvalidRequest { status, .. } => *status,
        }
    }

    /// The `detail` field of the response body. Interpreter errors keep
    /// their structure; everything else is a message.
    fn detail(&self) -> Value {
        match self {
            ApiError::Core(CoreError::ExecutionError(failure)) => json!({
                "error": "Execution error",
                "ename": failure.ename,
                "evalue": failure.evalue,
                "traceback": failure.traceback,
            }),
            other => Value::String(other.to_string()),
        }
    }
}

fn core_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::ExecutionError(_) => StatusCode::BAD_REQUEST,
        CoreError::ExecutionTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        CoreError::DependencyInstallFailure {
            kind: InstallFailureKind::TimedOut,
            ..
        } => StatusCode::REQUEST_TIMEOUT,
        CoreError::DependencyInstallFailure { .. } | CoreError::DependencyImportFailure { .. } => {
            StatusCode::BAD_REQUEST
        }
        CoreError::EngineStartFailure { .. }
        | CoreError::ReadinessTimeout { .. }
        | CoreError::EngineDead
        | CoreError::RestartFailure { .. }
        | CoreError::SessionInitFailure { .. }
        | CoreError::SessionUnrecoverable { .. }
        | CoreError::Io(_)
        | CoreError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<FormRejection> for ApiError {
    fn from(rejection: FormRejection) -> Self {
        ApiError::InvalidRequest {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.detail() }))).into_response()
    }
}
