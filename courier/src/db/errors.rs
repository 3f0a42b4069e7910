use thiserror::Error;

/// Unified error type for store operations that application code can handle
#[derive(Error, Debug)]
pub enum DbError {
    /// Entity not found by the given identifier
    #[error("Entity not found")]
    NotFound,

    /// Write rejected because it would violate a uniqueness or state constraint
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convert from sqlx::Error using sqlx error categorization
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Conflict {
                message: db_err.message().to_string(),
            },
            // All other sqlx errors are non-recoverable - convert to anyhow with context
            _ => DbError::Other(anyhow::Error::from(err)),
        }
    }
}

/// Type alias for store operation results
pub type Result<T> = std::result::Result<T, DbError>;
