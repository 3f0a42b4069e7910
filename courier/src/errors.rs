use crate::db::errors::DbError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// The delivery queue is no longer accepting intents (shutting down)
    #[error("Delivery queue is closed")]
    QueueClosed,

    /// Store operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::Conflict { .. } => StatusCode::CONFLICT,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::QueueClosed => "Service is shutting down".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::Conflict { .. } => "Resource was modified concurrently".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) | Error::QueueClosed => {
                tracing::warn!("Service unavailable or conflicting: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = serde_json::json!({ "message": self.user_message() });
        (status, axum::response::Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::BadRequest {
                message: "bad".to_string()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::QueueClosed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Error::Database(DbError::NotFound).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Database(DbError::Other(anyhow::anyhow!("pool timed out"))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = Error::Database(DbError::Other(anyhow::anyhow!("connection to 10.0.0.5 refused")));
        assert!(!err.user_message().contains("10.0.0.5"));

        let err = Error::NotFound {
            resource: "Subscription".to_string(),
            id: "abc".to_string(),
        };
        assert_eq!(err.user_message(), "Subscription with ID abc not found");
    }
}
