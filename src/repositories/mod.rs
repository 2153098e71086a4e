//! Repository layer for tenant registry access.

pub mod tenant;

pub use tenant::{NewTenantRecord, TenantRepository};

use thiserror::Error;

/// Errors surfaced by repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl RepositoryError {
    /// Wrap a database error, classifying unique-constraint violations as conflicts.
    pub fn database_error(err: sea_orm::DbErr) -> Self {
        if crate::error::is_unique_violation(&err) {
            RepositoryError::Conflict("record already exists".to_string())
        } else {
            RepositoryError::Database(err)
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        RepositoryError::Validation(message.into())
    }
}
