//! Database-level isolation: one database per tenant.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, ConnectTarget};
use crate::cache::{Closer, Connection, ConnectionCache};
use crate::config::{CacheConfig, DatabaseLevelConfig};
use crate::error::{TenantError, TenantResult};
use crate::tenant::TenantId;

/// Per-tenant count of deletions, so a connect can tell that the tenant was
/// deleted while it was running.
#[derive(Clone, Default)]
struct Deletions(Arc<Mutex<HashMap<TenantId, u64>>>);

impl Deletions {
    fn current(&self, tenant: &TenantId) -> u64 {
        self.0.lock().get(tenant).copied().unwrap_or(0)
    }

    fn record(&self, tenant: &TenantId) {
        *self.0.lock().entry(tenant.clone()).or_insert(0) += 1;
    }
}

fn deleted_while_connecting(tenant: &TenantId) -> TenantError {
    TenantError::tenant_not_found(tenant).with_help("The tenant was deleted while its connection was opening")
}

/// Database-level isolation with a dedicated client per tenant.
pub struct DatabaseStrategy<A: Adapter> {
    adapter: Arc<A>,
    base: ConnectTarget,
    naming: DatabaseLevelConfig,
    cache: ConnectionCache<A::Client>,
    deletions: Deletions,
}

impl<A: Adapter> DatabaseStrategy<A> {
    /// Create the strategy. `base` names the server; its database path is
    /// replaced per tenant.
    pub fn new(adapter: Arc<A>, base: ConnectTarget, naming: DatabaseLevelConfig, cache: CacheConfig) -> Self {
        let closing = Arc::clone(&adapter);
        let closer: Closer<A::Client> = Arc::new(move |client| {
            let adapter = Arc::clone(&closing);
            async move {
                if let Err(err) = adapter.close_client(client).await {
                    warn!(error = %err, "Failed to close tenant client");
                }
            }
            .boxed()
        });

        Self {
            adapter,
            base,
            naming,
            cache: ConnectionCache::new(cache, closer),
            deletions: Deletions::default(),
        }
    }

    /// The naming settings.
    pub fn naming(&self) -> &DatabaseLevelConfig {
        &self.naming
    }

    pub(crate) fn cache(&self) -> &ConnectionCache<A::Client> {
        &self.cache
    }

    /// Open (or reuse) the client for the tenant's database.
    ///
    /// A missing database is created when `auto_create` is set, otherwise
    /// the call fails with a not-found error. A connect overtaken by
    /// [`delete_tenant`](Self::delete_tenant) neither creates the database
    /// nor hands out its client; it fails with not-found.
    pub async fn get_connection(&self, tenant: &TenantId) -> TenantResult<Connection<A::Client>> {
        let name = self
            .naming
            .database_name(tenant)
            .map_err(|e| e.with_tenant(tenant))?;

        let adapter = Arc::clone(&self.adapter);
        let target = self.base.for_database(&name);
        let auto_create = self.naming.auto_create;
        let owner = tenant.clone();
        let deletions = self.deletions.clone();
        let generation = deletions.current(tenant);

        self.cache
            .get_or_connect(tenant, move || async move {
                let exists = adapter.list_databases().await?.iter().any(|db| *db == name);
                if !exists {
                    if !auto_create {
                        return Err(TenantError::tenant_not_found(&owner)
                            .with_help("Create the tenant first or enable auto_create"));
                    }
                    if deletions.current(&owner) != generation {
                        return Err(deleted_while_connecting(&owner));
                    }
                    match adapter.create_database(&name).await {
                        Ok(()) => info!(tenant = %owner, database = %name, "Auto-created tenant database"),
                        // Lost a race with another creator; the database is there.
                        Err(err) if err.is_already_exists() => {}
                        Err(err) => return Err(err),
                    }
                }
                debug!(tenant = %owner, database = %name, "Opening tenant client");
                let client = adapter.create_client(&target).await?;

                if deletions.current(&owner) != generation {
                    if let Err(err) = adapter.close_client(client).await {
                        warn!(tenant = %owner, error = %err, "Failed to close tenant client");
                    }
                    return Err(deleted_while_connecting(&owner));
                }
                Ok(client)
            })
            .await
            .map_err(|e| e.with_tenant(tenant).with_operation("get_connection"))
    }

    /// Create the tenant's database.
    pub async fn create_tenant(&self, tenant: &TenantId) -> TenantResult<()> {
        let name = self
            .naming
            .database_name(tenant)
            .map_err(|e| e.with_tenant(tenant))?;

        if self.database_exists(&name).await? {
            return Err(TenantError::tenant_already_exists(tenant));
        }

        self.adapter.create_database(&name).await.map_err(|err| {
            if err.is_already_exists() {
                TenantError::tenant_already_exists(tenant).with_source(err)
            } else {
                err.with_tenant(tenant).with_operation("create_tenant")
            }
        })?;

        info!(tenant = %tenant, database = %name, "Created tenant database");
        Ok(())
    }

    /// Drop the tenant's database.
    ///
    /// Connects already in flight for the tenant are waited for and turned
    /// into not-found errors. The cached client is closed before the drop
    /// and the cache entry is removed again afterwards, whether or not the
    /// drop succeeded.
    pub async fn delete_tenant(&self, tenant: &TenantId) -> TenantResult<()> {
        let name = self
            .naming
            .database_name(tenant)
            .map_err(|e| e.with_tenant(tenant))?;

        self.deletions.record(tenant);
        let result = self.drop_tenant_database(tenant, &name).await;
        self.cache.invalidate(tenant).await;

        match result {
            Ok(()) => {
                info!(tenant = %tenant, database = %name, "Dropped tenant database");
                Ok(())
            }
            Err(err) => {
                warn!(tenant = %tenant, database = %name, error = %err, "Failed to drop tenant database");
                Err(err.with_tenant(tenant).with_operation("delete_tenant"))
            }
        }
    }

    /// Check whether the tenant's database exists.
    pub async fn tenant_exists(&self, tenant: &TenantId) -> TenantResult<bool> {
        let exists = match self.naming.database_name(tenant) {
            Ok(name) => self.database_exists(&name).await,
            Err(err) => Err(err),
        };
        exists.map_err(|e| e.with_tenant(tenant).with_operation("tenant_exists"))
    }

    /// Tenants whose databases match the naming pattern, sorted.
    pub async fn list_tenants(&self) -> TenantResult<Vec<TenantId>> {
        let databases = self
            .adapter
            .list_databases()
            .await
            .map_err(|e| e.with_operation("list_tenants"))?;

        let mut tenants: Vec<TenantId> = databases
            .iter()
            .filter_map(|db| self.naming.tenant_from_database(db))
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    /// Close every tenant client and the adapter.
    pub async fn disconnect(&self) -> TenantResult<()> {
        self.cache.clear().await;
        self.adapter
            .disconnect()
            .await
            .map_err(|e| e.with_operation("disconnect"))
    }

    async fn database_exists(&self, name: &str) -> TenantResult<bool> {
        Ok(self
            .adapter
            .list_databases()
            .await?
            .iter()
            .any(|db| db == name))
    }

    async fn drop_tenant_database(&self, tenant: &TenantId, name: &str) -> TenantResult<()> {
        // Settles in-flight connects before looking, and closes the client;
        // servers refuse to drop a database in use.
        self.cache.invalidate(tenant).await;
        if !self.database_exists(name).await? {
            return Err(TenantError::tenant_not_found(tenant));
        }
        self.adapter.drop_database(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn strategy(naming: DatabaseLevelConfig) -> DatabaseStrategy<MemoryAdapter> {
        let adapter = Arc::new(MemoryAdapter::open("memory://local/app").unwrap());
        let base = ConnectTarget::parse("memory://local/app").unwrap();
        DatabaseStrategy::new(adapter, base, naming, CacheConfig::default())
    }

    fn tid(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_connect() {
        let strategy = strategy(DatabaseLevelConfig::default());
        strategy.create_tenant(&tid("acme")).await.unwrap();

        let conn = strategy.get_connection(&tid("acme")).await.unwrap();
        assert_eq!(conn.database(), "tenant_acme");
        assert!(strategy.tenant_exists(&tid("acme")).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let strategy = strategy(DatabaseLevelConfig::default());
        strategy.create_tenant(&tid("acme")).await.unwrap();

        let err = strategy.create_tenant(&tid("acme")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(err.context.tenant.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_missing_database_without_auto_create() {
        let strategy = strategy(DatabaseLevelConfig::default());
        let err = strategy.get_connection(&tid("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!strategy.cache.contains(&tid("ghost")));
        assert_eq!(strategy.adapter.stats().opened, 0);
    }

    #[tokio::test]
    async fn test_auto_create() {
        let strategy = strategy(DatabaseLevelConfig::default().with_auto_create());
        let conn = strategy.get_connection(&tid("acme")).await.unwrap();
        assert_eq!(conn.database(), "tenant_acme");
        assert_eq!(strategy.list_tenants().await.unwrap(), vec![tid("acme")]);
    }

    #[tokio::test]
    async fn test_tenants_use_separate_clients() {
        let strategy = strategy(DatabaseLevelConfig::default().with_auto_create());
        let a = strategy.get_connection(&tid("acme")).await.unwrap();
        let b = strategy.get_connection(&tid("globex")).await.unwrap();
        let again = strategy.get_connection(&tid("acme")).await.unwrap();

        assert_eq!(strategy.adapter.stats().opened, 2);
        assert_eq!(a.database(), again.database());

        let insert = r#"{"op": "insert", "collection": "orders", "documents": [{"n": 1}]}"#;
        strategy.adapter.execute_query(&a, insert, &[]).await.unwrap();
        let count = r#"{"op": "count", "collection": "orders"}"#;
        let rows = strategy.adapter.execute_query(&b, count, &[]).await.unwrap().rows;
        assert_eq!(rows, vec![json!({"count": 0})]);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_opens_once() {
        let strategy = Arc::new(strategy(DatabaseLevelConfig::default().with_auto_create()));
        strategy.adapter.set_connect_latency(Duration::from_millis(20));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let strategy = Arc::clone(&strategy);
                tokio::spawn(async move { strategy.get_connection(&tid("acme")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(strategy.adapter.stats().opened, 1);
    }

    #[tokio::test]
    async fn test_delete_closes_and_drops() {
        let strategy = strategy(DatabaseLevelConfig::default());
        strategy.create_tenant(&tid("acme")).await.unwrap();
        let conn = strategy.get_connection(&tid("acme")).await.unwrap();

        strategy.delete_tenant(&tid("acme")).await.unwrap();

        assert!(conn.is_closed());
        assert!(!strategy.cache.contains(&tid("acme")));
        assert!(!strategy.tenant_exists(&tid("acme")).await.unwrap());
        assert!(strategy.get_connection(&tid("acme")).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_auto_create_connect() {
        let strategy = Arc::new(strategy(DatabaseLevelConfig::default().with_auto_create()));
        strategy.adapter.set_connect_latency(Duration::from_millis(50));

        let connecting = {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.get_connection(&tid("acme")).await })
        };
        // The database is created; the client is still opening.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(strategy.tenant_exists(&tid("acme")).await.unwrap());

        strategy.delete_tenant(&tid("acme")).await.unwrap();

        let err = connecting.await.unwrap().unwrap_err();
        assert!(err.is_not_found());
        assert!(!strategy.tenant_exists(&tid("acme")).await.unwrap());
        assert!(!strategy.cache.contains(&tid("acme")));
        assert_eq!(strategy.adapter.stats().open(), 0);

        // A later connect auto-creates the tenant again.
        strategy.adapter.set_connect_latency(Duration::ZERO);
        strategy.get_connection(&tid("acme")).await.unwrap();
        assert!(strategy.tenant_exists(&tid("acme")).await.unwrap());
    }

    #[tokio::test]
    async fn test_tenant_exists_error_context() {
        let strategy = strategy(DatabaseLevelConfig::default());
        strategy.adapter.set_available(false);

        let err = strategy.tenant_exists(&tid("acme")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(err.context.tenant.as_deref(), Some("acme"));
        assert_eq!(err.context.operation.as_deref(), Some("tenant_exists"));
    }

    #[tokio::test]
    async fn test_delete_missing_tenant() {
        let strategy = strategy(DatabaseLevelConfig::default());
        let err = strategy.delete_tenant(&tid("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.context.operation.as_deref(), Some("delete_tenant"));
    }

    #[tokio::test]
    async fn test_delete_failure_still_evicts() {
        let strategy = strategy(DatabaseLevelConfig::default());
        strategy.create_tenant(&tid("acme")).await.unwrap();
        let _conn = strategy.get_connection(&tid("acme")).await.unwrap();

        strategy.adapter.set_available(false);
        assert!(strategy.delete_tenant(&tid("acme")).await.unwrap_err().is_connection_error());
        assert!(!strategy.cache.contains(&tid("acme")));
    }

    #[tokio::test]
    async fn test_list_tenants_ignores_other_databases() {
        let strategy = strategy(DatabaseLevelConfig::default().with_prefix("t_").with_suffix("_db"));
        strategy.create_tenant(&tid("b")).await.unwrap();
        strategy.create_tenant(&tid("a")).await.unwrap();
        strategy.adapter.create_database("analytics").await.unwrap();
        strategy.adapter.create_database("t_x").await.unwrap();

        assert_eq!(strategy.list_tenants().await.unwrap(), vec![tid("a"), tid("b")]);
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let strategy = strategy(DatabaseLevelConfig::default().with_auto_create());
        let a = strategy.get_connection(&tid("acme")).await.unwrap();
        let b = strategy.get_connection(&tid("globex")).await.unwrap();

        strategy.disconnect().await.unwrap();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(strategy.adapter.stats().open(), 0);
    }
}
