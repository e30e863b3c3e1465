//! Tenant isolation strategies.
//!
//! A strategy turns a tenant into a connection and owns the tenant
//! lifecycle. Both strategies are built on one [`Adapter`] and keep their
//! own [`ConnectionCache`](crate::cache::ConnectionCache).
//!
//! | Strategy | Storage | `create_tenant` | `delete_tenant` |
//! |----------|---------|-----------------|-----------------|
//! | Row | Shared tables, tenant column | Records the tenant | Deletes the tenant's rows |
//! | Database | One database per tenant | Creates the database | Drops the database |

mod database;
mod row;

pub use database::DatabaseStrategy;
pub use row::RowStrategy;

use std::sync::Arc;

use crate::adapter::{Adapter, ConnectTarget};
use crate::cache::{CacheStats, Connection};
use crate::config::{ResolvedConfig, StrategyKind};
use crate::error::TenantResult;
use crate::tenant::TenantId;

/// The strategy selected for a database.
pub enum Strategy<A: Adapter> {
    /// Row-level isolation.
    Row(RowStrategy<A>),
    /// Database-level isolation.
    Database(DatabaseStrategy<A>),
}

impl<A: Adapter> Strategy<A> {
    /// Build the strategy a resolved config asks for.
    pub fn new(adapter: Arc<A>, resolved: &ResolvedConfig) -> Self {
        let base = ConnectTarget::new(resolved.url.clone());
        let config = &resolved.config;
        match resolved.strategy {
            StrategyKind::Row => Self::Row(RowStrategy::new(
                adapter,
                base,
                config.row.clone(),
                config.cache.clone(),
            )),
            StrategyKind::Database => Self::Database(DatabaseStrategy::new(
                adapter,
                base,
                config.database.clone(),
                config.cache.clone(),
            )),
        }
    }

    /// The strategy kind.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Row(_) => StrategyKind::Row,
            Self::Database(_) => StrategyKind::Database,
        }
    }

    /// Get a connection confined to the tenant.
    pub async fn get_connection(&self, tenant: &TenantId) -> TenantResult<Connection<A::Client>> {
        match self {
            Self::Row(s) => s.get_connection(tenant).await,
            Self::Database(s) => s.get_connection(tenant).await,
        }
    }

    /// Provision the tenant.
    pub async fn create_tenant(&self, tenant: &TenantId) -> TenantResult<()> {
        match self {
            Self::Row(s) => s.create_tenant(tenant).await,
            Self::Database(s) => s.create_tenant(tenant).await,
        }
    }

    /// Remove the tenant's data and its cached connection.
    pub async fn delete_tenant(&self, tenant: &TenantId) -> TenantResult<()> {
        match self {
            Self::Row(s) => s.delete_tenant(tenant).await,
            Self::Database(s) => s.delete_tenant(tenant).await,
        }
    }

    /// Check whether the tenant exists.
    pub async fn tenant_exists(&self, tenant: &TenantId) -> TenantResult<bool> {
        match self {
            Self::Row(s) => s.tenant_exists(tenant).await,
            Self::Database(s) => s.tenant_exists(tenant).await,
        }
    }

    /// List known tenants, sorted.
    pub async fn list_tenants(&self) -> TenantResult<Vec<TenantId>> {
        match self {
            Self::Row(s) => s.list_tenants().await,
            Self::Database(s) => s.list_tenants().await,
        }
    }

    /// Close every cached connection and the adapter's clients.
    pub async fn disconnect(&self) -> TenantResult<()> {
        match self {
            Self::Row(s) => s.disconnect().await,
            Self::Database(s) => s.disconnect().await,
        }
    }

    /// Evict expired cache entries. Returns the number evicted.
    pub async fn evict_expired(&self) -> usize {
        match self {
            Self::Row(s) => s.cache().evict_expired().await,
            Self::Database(s) => s.cache().evict_expired().await,
        }
    }

    /// Snapshot the cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        match self {
            Self::Row(s) => s.cache().stats(),
            Self::Database(s) => s.cache().stats(),
        }
    }
}
