use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from sea-orm.
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// An insert-only write hit an existing natural key.
    ///
    /// Only surfaced by the insert-only fast path; the upsert path resolves
    /// it by falling back to lookup-then-upsert.
    #[error("Duplicate key: {message}")]
    DuplicateKey { message: String },

    /// Invalid input data.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl StoreError {
    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Classify a database error, separating unique-key violations.
    pub fn from_db(err: DbErr) -> Self {
        if is_unique_violation(&err) {
            Self::DuplicateKey {
                message: err.to_string(),
            }
        } else {
            Self::Database(err)
        }
    }

    #[inline]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }

    /// Check if the error is transient and the write may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(db_err) => is_retryable_db_error(db_err),
            _ => false,
        }
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    let err_str = err.to_string().to_lowercase();
    // SQLite: "UNIQUE constraint failed"; PostgreSQL: "duplicate key value violates unique constraint"
    err_str.contains("unique constraint failed") || err_str.contains("duplicate key")
}

fn is_retryable_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let err_str = err.to_string().to_lowercase();
            // SQLite: database is locked, busy
            // PostgreSQL: connection refused, too many connections
            err_str.contains("locked")
                || err_str.contains("busy")
                || err_str.contains("timeout")
                || err_str.contains("connection")
                || err_str.contains("temporarily unavailable")
        }
        _ => false,
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::RuntimeErr;

    fn exec_err(message: &str) -> DbErr {
        DbErr::Exec(RuntimeErr::Internal(message.to_string()))
    }

    #[test]
    fn from_db_detects_sqlite_unique_violation() {
        let err = StoreError::from_db(exec_err(
            "UNIQUE constraint failed: comments.partition_id, comments.item_id",
        ));
        assert!(err.is_duplicate_key());
        assert!(!err.is_retryable());
    }

    #[test]
    fn from_db_detects_postgres_unique_violation() {
        let err = StoreError::from_db(exec_err(
            "duplicate key value violates unique constraint \"idx_comments_partition_item\"",
        ));
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn locked_database_is_retryable() {
        let err = StoreError::from_db(exec_err("database is locked"));
        assert!(!err.is_duplicate_key());
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_input_is_not_retryable() {
        assert!(!StoreError::invalid_input("empty item id").is_retryable());
        assert!(!StoreError::from_db(DbErr::Custom("bad".to_string())).is_retryable());
    }
}
