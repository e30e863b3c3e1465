//! Error types for PostgreSQL operations.

use tenantdb_core::{ErrorCode, TenantError};
use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors raised inside the PostgreSQL adapter.
///
/// Everything leaves the crate as a [`TenantError`]; this type exists so that
/// driver errors can be classified in one place.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Pool construction error.
    #[error("pool build error: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Type conversion error.
    #[error("type conversion error: {0}")]
    TypeConversion(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a type conversion error.
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion(message.into())
    }

    /// The SQLSTATE code reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Postgres(e) => e.code().map(|c| c.code()),
            Self::Pool(deadpool_postgres::PoolError::Backend(e)) => e.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Pool(deadpool_postgres::PoolError::Backend(e)) | Self::Postgres(e) => match e.code() {
                Some(code) => is_connection_state(code.code()),
                // No SQLSTATE means the error never came from the server.
                None => true,
            },
            Self::Pool(_) => true,
            _ => false,
        }
    }
}

fn is_connection_state(state: &str) -> bool {
    // 08: connection exception, 28: invalid authorization, 57P0x: shutdown
    state.starts_with("08") || state.starts_with("28") || state.starts_with("57P0")
}

impl From<PgError> for TenantError {
    fn from(err: PgError) -> Self {
        let message = err.to_string();
        let mapped = match err.sql_state() {
            // duplicate_database
            Some("42P04") => TenantError::new(ErrorCode::TenantAlreadyExists, message),
            // invalid_catalog_name
            Some("3D000") => TenantError::new(ErrorCode::TenantNotFound, message),
            _ => match &err {
                PgError::Config(_) => TenantError::configuration(message),
                PgError::Build(_) => TenantError::configuration(message),
                PgError::TypeConversion(_) => TenantError::invalid_query(message),
                _ if err.is_connection_error() => TenantError::connection(message),
                _ => TenantError::database(message),
            },
        };
        mapped.with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantdb_core::ErrorKind;

    #[test]
    fn test_config_error_maps_to_configuration() {
        let err: TenantError = PgError::config("missing host").into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.message.contains("missing host"));
    }

    #[test]
    fn test_type_conversion_maps_to_validation() {
        let err: TenantError = PgError::type_conversion("expected integer").into();
        assert_eq!(err.code, ErrorCode::InvalidQuery);
        assert!(err.source.is_some());
    }

    #[test]
    fn test_pool_timeout_is_connection_error() {
        let err = PgError::Pool(deadpool_postgres::PoolError::Closed);
        assert!(err.is_connection_error());
        assert_eq!(err.sql_state(), None);

        let err: TenantError = err.into();
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_connection_states() {
        assert!(is_connection_state("08006"));
        assert!(is_connection_state("28P01"));
        assert!(is_connection_state("57P01"));
        assert!(!is_connection_state("42P01"));
    }
}
