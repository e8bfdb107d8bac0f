use crate::services::upload_service::UploadError;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("unhandled error: {:#}", err);
        AppError::internal("internal server error")
    }
}

/// Map workflow errors onto HTTP statuses.
///
/// Server-side failures are already logged with their context by the service;
/// the client only sees a generic message for them.
impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(msg) => AppError::bad_request(msg),
            UploadError::NotFound(_) | UploadError::ObjectNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            UploadError::Forbidden { .. } => {
                AppError::new(StatusCode::FORBIDDEN, "upload belongs to another user")
            }
            UploadError::Conflict(msg) => AppError::new(StatusCode::CONFLICT, msg),
            UploadError::Incomplete { .. } => AppError::bad_request(err.to_string()),
            UploadError::Storage(_) => AppError::internal("storage failure"),
            UploadError::Persistence(_) => AppError::internal("database failure"),
            UploadError::Reassembly(_) => AppError::internal("failed to assemble upload"),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::bad_request(rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use uuid::Uuid;

    #[test]
    fn upload_errors_map_to_statuses() {
        let cases = [
            (UploadError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (UploadError::NotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                UploadError::Forbidden {
                    upload_id: Uuid::nil(),
                },
                StatusCode::FORBIDDEN,
            ),
            (UploadError::Conflict("busy".into()), StatusCode::CONFLICT),
            (
                UploadError::Incomplete {
                    received: 1,
                    total: 3,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                UploadError::Storage(io::Error::other("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                UploadError::Reassembly("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = AppError::from(UploadError::Storage(io::Error::other(
            "/srv/data/alice/secret path",
        )));
        assert!(!err.message.contains("/srv"));

        let incomplete = AppError::from(UploadError::Incomplete {
            received: 2,
            total: 5,
        });
        assert_eq!(incomplete.message, "received 2 of 5 chunks");
    }
}
