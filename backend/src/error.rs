use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Insufficient permissions: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invitation has expired")]
    Expired,

    #[error("Invitation was sent to a different email address")]
    EmailMismatch,

    #[error("Organization must keep at least one owner")]
    LastOwnerViolation,

    #[error("Storage temporarily unavailable")]
    Unavailable,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    /// Machine-readable error kind carried in every error response.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) | AppError::Validation(_) => "validation_error",
            AppError::Conflict(_) => "conflict",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Expired => "expired",
            AppError::EmailMismatch => "email_mismatch",
            AppError::LastOwnerViolation => "last_owner_violation",
            AppError::Unavailable => "unavailable",
            AppError::Database(e) => match pg_error_code(e).as_deref() {
                Some("23505") => "conflict",
                Some("23503") => "not_found",
                _ => "internal_error",
            },
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Storage faults worth retrying: lost connections, pool exhaustion and
    /// Postgres serialization/deadlock aborts. Business-rule failures never are.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                    true
                }
                sqlx::Error::Database(_) => {
                    matches!(pg_error_code(e).as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

fn pg_error_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let kind = self.kind();
        let (status, message) = match &self {
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::InvalidState(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Expired => (StatusCode::GONE, self.to_string()),
            AppError::EmailMismatch => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::LastOwnerViolation => (StatusCode::CONFLICT, self.to_string()),
            AppError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Validation(e) => {
                let messages: Vec<String> = e
                    .field_errors()
                    .into_iter()
                    .map(|(field, errors)| {
                        let msgs: Vec<&str> = errors
                            .iter()
                            .filter_map(|err| err.message.as_ref().map(|m| m.as_ref()))
                            .collect();
                        if msgs.is_empty() {
                            let codes: Vec<&str> =
                                errors.iter().map(|err| err.code.as_ref()).collect();
                            format!("{}: {}", field, codes.join(", "))
                        } else {
                            format!("{}: {}", field, msgs.join(", "))
                        }
                    })
                    .collect();
                (StatusCode::BAD_REQUEST, messages.join("; "))
            }
            AppError::Database(e) => match kind {
                "conflict" => {
                    tracing::warn!("Unique constraint violation: {}", e);
                    (
                        StatusCode::CONFLICT,
                        "A record with that value already exists".to_string(),
                    )
                }
                "not_found" => {
                    tracing::warn!("Foreign key violation: {}", e);
                    (
                        StatusCode::NOT_FOUND,
                        "Referenced record does not exist".to_string(),
                    )
                }
                _ => {
                    tracing::error!("Database error: {:?}", e);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Database error".into())
                }
            },
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
