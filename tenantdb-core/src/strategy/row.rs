//! Row-level isolation: all tenants share storage, rows carry a tenant column.
//!
//! Precondition: every tenant-bearing table or collection has the tenant
//! column (nullable is fine). Rows written through a tenant connection are
//! stamped with the tenant; rows without a value belong to nobody.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, ConnectTarget};
use crate::cache::{Closer, Connection, ConnectionCache};
use crate::config::{CacheConfig, RowLevelConfig};
use crate::error::TenantResult;
use crate::tenant::{TenantId, TenantScope};

/// Row-level isolation over one shared adapter client.
pub struct RowStrategy<A: Adapter> {
    adapter: Arc<A>,
    target: ConnectTarget,
    config: RowLevelConfig,
    shared: Arc<HashSet<String>>,
    cache: ConnectionCache<A::Client>,
    known: RwLock<BTreeSet<TenantId>>,
}

impl<A: Adapter> RowStrategy<A> {
    /// Create the strategy. Nothing connects until first use.
    pub fn new(adapter: Arc<A>, target: ConnectTarget, config: RowLevelConfig, cache: CacheConfig) -> Self {
        // Scoped clients are views over the shared client; only disconnect closes it.
        let closer: Closer<A::Client> = Arc::new(|_client| futures::future::ready(()).boxed());
        Self {
            adapter,
            target,
            shared: Arc::new(config.shared_tables.clone()),
            config,
            cache: ConnectionCache::new(cache, closer),
            known: RwLock::new(BTreeSet::new()),
        }
    }

    /// The row-level settings.
    pub fn config(&self) -> &RowLevelConfig {
        &self.config
    }

    pub(crate) fn cache(&self) -> &ConnectionCache<A::Client> {
        &self.cache
    }

    fn scope(&self, tenant: &TenantId) -> TenantScope {
        TenantScope::new(tenant.clone(), self.config.column.clone()).with_shared_tables(Arc::clone(&self.shared))
    }

    /// Get the shared client wrapped in the tenant's scope.
    pub async fn get_connection(&self, tenant: &TenantId) -> TenantResult<Connection<A::Client>> {
        let adapter = Arc::clone(&self.adapter);
        let target = self.target.clone();
        let scope = self.scope(tenant);

        self.cache
            .get_or_connect(tenant, move || async move {
                let base = adapter.connect(&target).await?;
                Ok(adapter.apply_tenant_middleware(&base, &scope))
            })
            .await
            .map_err(|e| e.with_tenant(tenant).with_operation("get_connection"))
    }

    /// Record the tenant. Row-level tenants need no provisioning.
    pub async fn create_tenant(&self, tenant: &TenantId) -> TenantResult<()> {
        if self.known.write().insert(tenant.clone()) {
            debug!(tenant = %tenant, "Registered row-level tenant");
        }
        Ok(())
    }

    /// Delete the tenant's rows from every tenant-bearing table.
    ///
    /// The cached connection is removed even when the delete fails.
    pub async fn delete_tenant(&self, tenant: &TenantId) -> TenantResult<()> {
        let result = self.delete_rows(tenant).await;
        self.known.write().remove(tenant);
        self.cache.invalidate(tenant).await;

        match result {
            Ok(rows) => {
                info!(tenant = %tenant, rows, "Deleted row-level tenant");
                Ok(())
            }
            Err(err) => {
                warn!(tenant = %tenant, error = %err, "Failed to delete tenant rows");
                Err(err.with_tenant(tenant).with_operation("delete_tenant"))
            }
        }
    }

    /// A tenant exists once created or once any row carries it.
    pub async fn tenant_exists(&self, tenant: &TenantId) -> TenantResult<bool> {
        if self.known.read().contains(tenant) {
            return Ok(true);
        }
        Ok(self.stored_tenants().await?.contains(tenant))
    }

    /// Tenants found in the data plus tenants created through this strategy.
    pub async fn list_tenants(&self) -> TenantResult<Vec<TenantId>> {
        let mut tenants = self.stored_tenants().await?;
        tenants.extend(self.known.read().iter().cloned());
        Ok(tenants.into_iter().collect())
    }

    /// Drop every cached connection and close the shared client.
    pub async fn disconnect(&self) -> TenantResult<()> {
        self.cache.clear().await;
        self.adapter
            .disconnect()
            .await
            .map_err(|e| e.with_operation("disconnect"))
    }

    async fn delete_rows(&self, tenant: &TenantId) -> TenantResult<u64> {
        let base = self.adapter.connect(&self.target).await?;
        let mut deleted = 0;
        for table in self.tables(&base).await? {
            let rows = self
                .adapter
                .delete_tenant_rows(&base, &table, &self.config.column, tenant)
                .await?;
            debug!(tenant = %tenant, table = %table, rows, "Deleted tenant rows");
            deleted += rows;
        }
        Ok(deleted)
    }

    async fn stored_tenants(&self) -> TenantResult<BTreeSet<TenantId>> {
        let base = self
            .adapter
            .connect(&self.target)
            .await
            .map_err(|e| e.with_operation("list_tenants"))?;

        let mut tenants = BTreeSet::new();
        for table in self.tables(&base).await? {
            let values = self
                .adapter
                .distinct_tenants(&base, &table, &self.config.column)
                .await?;
            for value in values {
                match TenantId::new(value.as_str()) {
                    Ok(tenant) => {
                        tenants.insert(tenant);
                    }
                    Err(_) => debug!(table = %table, value = %value, "Ignoring invalid stored tenant id"),
                }
            }
        }
        Ok(tenants)
    }

    /// Configured tables, or the ones discovered from the store.
    async fn tables(&self, base: &A::Client) -> TenantResult<Vec<String>> {
        let tables = if self.config.tables.is_empty() {
            self.adapter.tenant_tables(base, &self.config.column).await?
        } else {
            self.config.tables.clone()
        };
        Ok(tables
            .into_iter()
            .filter(|table| !self.shared.contains(table))
            .collect())
    }
}
