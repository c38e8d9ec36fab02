//! Store Error Types
//!
//! Centralized error handling for option and metadata storage.
//!
//! Most domain failures (invalid input, missing rows, unchanged values) are
//! reported through `false`/`None` return values by the stores. The variants
//! below cover what the storage backends and the protected-option guard
//! need to surface.

use crate::serialize::UnserializeError;

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Unserialize error: {0}")]
    Unserialize(#[from] UnserializeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Option \"{0}\" is protected and cannot be modified")]
    ProtectedOption(String),

    #[error("Unknown meta type: {0}")]
    UnknownMetaType(String),
}

/// Result alias used by storage backends
pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        StoreError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_option_message() {
        let err = StoreError::ProtectedOption("alloptions".into());
        assert_eq!(
            err.to_string(),
            "Option \"alloptions\" is protected and cannot be modified"
        );
    }

    #[test]
    fn test_sqlx_conversion() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
