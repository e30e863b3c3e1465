//! Tenant identifiers and the scope a tenant-bound client runs under.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{TenantError, TenantResult};

/// Longest identifier accepted for tenants, columns and database names.
///
/// Matches the PostgreSQL identifier limit so that a tenant id can always be
/// embedded in a database name.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `value` is a safe identifier: 1 to 63 ASCII letters, digits,
/// `-` or `_`.
///
/// `what` names the identifier in the error message ("tenant id",
/// "database name", ...).
pub fn validate_identifier(what: &str, value: &str) -> TenantResult<()> {
    if value.is_empty() {
        return Err(TenantError::invalid_identifier(what, value, "must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(TenantError::invalid_identifier(
            what,
            value,
            format!("longer than {} bytes", MAX_IDENTIFIER_LEN),
        ));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TenantError::invalid_identifier(
            what,
            value,
            format!("contains disallowed character {:?}", c),
        ));
    }
    Ok(())
}

/// A validated tenant identifier.
///
/// Construction always goes through [`validate_identifier`], so a `TenantId`
/// is safe to embed in database names and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant identifier.
    pub fn new(id: impl Into<String>) -> TenantResult<Self> {
        let id = id.into();
        validate_identifier("tenant id", &id)?;
        Ok(Self(id))
    }

    /// Get the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for TenantId {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for TenantId {
    type Error = TenantError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// The row-level scope a tenant-bound client enforces.
///
/// Carries the tenant, the column that holds it and the tables that are
/// shared between tenants and therefore never filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    tenant: TenantId,
    column: String,
    shared: Arc<HashSet<String>>,
}

impl TenantScope {
    /// Scope `tenant` through `column`.
    pub fn new(tenant: TenantId, column: impl Into<String>) -> Self {
        Self {
            tenant,
            column: column.into(),
            shared: Arc::new(HashSet::new()),
        }
    }

    /// Tables that are exempt from filtering.
    pub fn with_shared_tables(mut self, shared: Arc<HashSet<String>>) -> Self {
        self.shared = shared;
        self
    }

    /// The tenant this scope enforces.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The tenant column.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Whether `table` is shared and must be left unfiltered.
    ///
    /// Schema-qualified names match on either the full name or the bare table.
    pub fn is_shared(&self, table: &str) -> bool {
        if self.shared.contains(table) {
            return true;
        }
        match table.rsplit_once('.') {
            Some((_, bare)) => self.shared.contains(bare),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_valid() {
        for id in ["acme", "tenant-1", "TENANT_2", "a", "x".repeat(63).as_str()] {
            assert!(TenantId::new(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_tenant_id_invalid() {
        for id in ["", "a b", "acme;drop", "café", "../etc", "a.b", "x".repeat(64).as_str()] {
            let err = TenantId::new(id).unwrap_err();
            assert!(err.is_validation_error(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn test_tenant_id_conversions() {
        let id: TenantId = "acme".parse().unwrap();
        assert_eq!(id.as_str(), "acme");
        assert_eq!(id.to_string(), "acme");
        assert_eq!(String::from(id.clone()), "acme");
        assert!(TenantId::try_from("bad id").is_err());
    }

    #[test]
    fn test_tenant_id_serde_validates() {
        let id: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(id.as_str(), "acme");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"acme\"");
        assert!(serde_json::from_str::<TenantId>("\"no way\"").is_err());
    }

    #[test]
    fn test_scope_shared_tables() {
        let shared: HashSet<String> = ["plans".to_string()].into_iter().collect();
        let scope = TenantScope::new(TenantId::new("acme").unwrap(), "tenant_id")
            .with_shared_tables(Arc::new(shared));

        assert_eq!(scope.column(), "tenant_id");
        assert_eq!(scope.tenant().as_str(), "acme");
        assert!(scope.is_shared("plans"));
        assert!(scope.is_shared("public.plans"));
        assert!(!scope.is_shared("users"));
    }
}
