//! Store-level error type and its conversion into the engine taxonomy.

use subcast_core::SubcastError;
use thiserror::Error;

/// Errors local to the `SQLite` store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON (de)serialization of a stored column failed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },
}

impl From<StoreError> for SubcastError {
    fn from(err: StoreError) -> Self {
        SubcastError::Store(err.to_string())
    }
}

/// Convenience type alias for store-internal results.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn migration_error_display() {
        let err = StoreError::Migration {
            message: "v001 failed".into(),
        };
        assert_eq!(err.to_string(), "migration error: v001 failed");
    }

    #[test]
    fn converts_into_engine_error() {
        let err: SubcastError = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).into();
        assert!(matches!(err, SubcastError::Store(_)));
    }
}
