//! Crate-wide error taxonomy.
//!
//! Every public repository method returns `Result<T, RepositoryError>`. Kinds are
//! never transport-specific: a SQLite-ism never leaks past this module except as
//! the `message` payload of [`RepositoryError::Connection`].

use thiserror::Error;

/// The three configuration failure subkinds.
#[derive(Debug, Error)]
pub enum ConfigErrorKind {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("configuration validation failed: {0}")]
    Validation(String),
    #[error("configuration update refused: {0}")]
    Update(String),
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate resource: {0}")]
    DuplicateResource(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transaction aborted: {0}")]
    Transaction(String),

    #[error("configuration error")]
    Configuration(#[from] ConfigErrorKind),
}

impl RepositoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::DuplicateResource(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// True when the underlying SQLite error is transient and worth retrying
    /// (busy/locked database), as opposed to a constraint or type error.
    pub(crate) fn is_transient(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(ffi_err, _)
                if matches!(
                    ffi_err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => {
                RepositoryError::NotFound("query returned no rows".into())
            }
            rusqlite::Error::SqliteFailure(ffi_err, msg) => {
                if matches!(
                    ffi_err.code,
                    rusqlite::ErrorCode::ConstraintViolation
                ) {
                    RepositoryError::DuplicateResource(
                        msg.clone().unwrap_or_else(|| err.to_string()),
                    )
                } else if RepositoryError::is_transient(&err) {
                    RepositoryError::Connection(err.to_string())
                } else {
                    RepositoryError::Validation(err.to_string())
                }
            }
            _ => RepositoryError::Validation(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Validation(format!("JSON error: {err}"))
    }
}

impl From<r2d2::Error> for RepositoryError {
    fn from(err: r2d2::Error) -> Self {
        RepositoryError::Connection(format!("connection pool exhausted: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
