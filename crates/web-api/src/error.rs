use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIAL", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "NOT_AUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use domain::{DomainError, RepositoryError};

        match error {
            ApplicationError::Domain(DomainError::InvalidCredential) => {
                ApiError::unauthorized("invalid or expired credential")
            }
            ApplicationError::Domain(DomainError::NotAuthorized) => {
                ApiError::forbidden("not a member of the target conversation")
            }
            ApplicationError::Domain(DomainError::InvalidState { reason }) => {
                ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", reason)
            }
            ApplicationError::Domain(DomainError::InvalidArgument { field, reason }) => {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "INVALID_ARGUMENT",
                    format!("{field}: {reason}"),
                )
            }
            ApplicationError::Domain(DomainError::ConversationNotFound) => ApiError::new(
                StatusCode::NOT_FOUND,
                "CONVERSATION_NOT_FOUND",
                "conversation not found",
            ),
            ApplicationError::Domain(DomainError::MessageNotFound) => ApiError::new(
                StatusCode::NOT_FOUND,
                "MESSAGE_NOT_FOUND",
                "message not found",
            ),
            ApplicationError::Repository(repo_err) => match repo_err {
                RepositoryError::NotFound => {
                    ApiError::not_found("requested resource not found")
                }
                RepositoryError::Conflict => ApiError::conflict("resource already exists"),
                RepositoryError::InvalidState { reason } => {
                    ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", reason)
                }
                RepositoryError::Storage { message, .. } => ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    format!("database error: {message}"),
                ),
            },
            ApplicationError::Identity(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "IDENTITY_ERROR",
                format!("identity error: {err}"),
            ),
            ApplicationError::Infrastructure(message) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INFRASTRUCTURE_ERROR",
                message,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
