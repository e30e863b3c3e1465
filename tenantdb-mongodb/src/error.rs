//! Error types for MongoDB operations.

use mongodb::error::ErrorKind as DriverErrorKind;
use tenantdb_core::TenantError;
use thiserror::Error;

/// Result type for MongoDB operations.
pub type MongoResult<T> = Result<T, MongoError>;

/// Errors raised inside the MongoDB adapter.
#[derive(Error, Debug)]
pub enum MongoError {
    /// MongoDB driver error.
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// BSON serialization error.
    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Document conversion error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MongoError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Driver(e) => matches!(
                *e.kind,
                DriverErrorKind::ServerSelection { .. }
                    | DriverErrorKind::Io(_)
                    | DriverErrorKind::ConnectionPoolCleared { .. }
                    | DriverErrorKind::Authentication { .. }
                    | DriverErrorKind::DnsResolve { .. }
            ),
            _ => false,
        }
    }
}

impl From<MongoError> for TenantError {
    fn from(err: MongoError) -> Self {
        let message = err.to_string();
        let mapped = match &err {
            MongoError::Config(_) => TenantError::configuration(message),
            MongoError::Bson(_) | MongoError::Serialization(_) => TenantError::invalid_query(message),
            MongoError::Driver(_) if err.is_connection_error() => TenantError::connection(message),
            MongoError::Driver(_) => TenantError::database(message),
        };
        mapped.with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantdb_core::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = MongoError::config("test error");
        assert_eq!(err.to_string(), "configuration error: test error");
    }

    #[test]
    fn test_into_tenant_error() {
        let err: TenantError = MongoError::config("bad uri").into();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err: TenantError = MongoError::serialization("not an object").into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.source.is_some());
    }

    #[test]
    fn test_non_driver_errors_are_not_connection_errors() {
        assert!(!MongoError::config("x").is_connection_error());
    }
}
