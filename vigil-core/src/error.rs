use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not valid: {0}")]
    NotValid(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Classify a driver error raised while performing `operation`.
    ///
    /// Constraint violations are reported as their domain meaning; anything
    /// else is wrapped as an internal error carrying the operation context.
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::RowNotFound = err {
            return CoordError::NotFound(operation.to_string());
        }

        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return CoordError::AlreadyExists(format!(
                    "{operation}: {}",
                    db_err.message()
                ));
            }
            if db_err.is_foreign_key_violation() {
                return CoordError::NotFound(format!(
                    "{operation}: {}",
                    db_err.message()
                ));
            }
        }

        CoordError::Internal(format!("{operation} failed: {err}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
