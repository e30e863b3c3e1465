//! The `TenantDatabase` facade.
//!
//! One handle per application: it owns the adapter and the selected strategy
//! and hands out tenant connections.
//!
//! ```rust
//! use tenantdb_core::adapter::MemoryAdapter;
//! use tenantdb_core::config::{DatabaseConfig, StrategyKind};
//! use tenantdb_core::TenantDatabase;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tenantdb_core::TenantResult<()> {
//! let config = DatabaseConfig::new("memory://local/app").with_strategy(StrategyKind::Row);
//! let db = TenantDatabase::with_adapter(config, MemoryAdapter::open("memory://local/app")?)?;
//!
//! let conn = db.get_connection("acme").await?;
//! db.execute(&conn, r#"{"op": "insert", "collection": "users", "documents": [{"name": "ada"}]}"#, &[])
//!     .await?;
//!
//! db.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, QueryResponse};
use crate::cache::{CacheStats, Connection};
use crate::config::{AdapterKind, DatabaseConfig, Provider, ResolvedConfig, StdEnvSource, StrategyKind};
use crate::error::{TenantError, TenantResult};
use crate::strategy::Strategy;
use crate::tenant::TenantId;

struct Inner<A: Adapter> {
    config: ResolvedConfig,
    adapter: Arc<A>,
    strategy: Strategy<A>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Adapter> Drop for Inner<A> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Tenant-aware access to one database server.
///
/// Cloning is cheap; clones share the adapter, strategy and cache.
pub struct TenantDatabase<A: Adapter> {
    inner: Arc<Inner<A>>,
}

impl<A: Adapter> Clone for TenantDatabase<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Adapter> TenantDatabase<A> {
    /// Build a database over an injected adapter.
    ///
    /// The config is resolved against the process environment.
    pub fn with_adapter(config: DatabaseConfig, adapter: A) -> TenantResult<Self> {
        let resolved = config.resolve(&StdEnvSource)?;
        Self::from_resolved(resolved, adapter)
    }

    /// Build a database from an already resolved config.
    pub fn from_resolved(config: ResolvedConfig, adapter: A) -> TenantResult<Self> {
        if adapter.kind() != config.adapter {
            return Err(TenantError::configuration(format!(
                "A {} adapter was supplied for a {} URL",
                adapter.kind(),
                config.adapter
            ))
            .with_help("Pass an adapter matching the URL scheme or set `adapter` explicitly"));
        }

        let adapter = Arc::new(adapter);
        let strategy = Strategy::new(Arc::clone(&adapter), &config);
        let sweep_interval = config.config.cache.sweep_interval;

        info!(
            url = %config.redacted_url(),
            strategy = %config.strategy,
            adapter = %config.adapter,
            provider = %config.provider,
            "Tenant database ready"
        );

        let inner = Arc::new(Inner {
            config,
            adapter,
            strategy,
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });
        if let Some(interval) = sweep_interval {
            *inner.sweeper.lock() = spawn_sweeper(Arc::downgrade(&inner), interval);
        }

        Ok(Self { inner })
    }

    /// Get a connection for a tenant given as a string.
    ///
    /// The identifier is validated before any I/O.
    pub async fn get_connection(&self, tenant: impl AsRef<str>) -> TenantResult<Connection<A::Client>> {
        self.ensure_open()?;
        let tenant = TenantId::new(tenant.as_ref())?;
        self.connect_tenant(&tenant).await
    }

    /// Get a connection for an already validated tenant.
    pub async fn connect_tenant(&self, tenant: &TenantId) -> TenantResult<Connection<A::Client>> {
        self.ensure_open()?;
        self.inner.strategy.get_connection(tenant).await
    }

    /// Run a raw query on a tenant connection.
    pub async fn execute(
        &self,
        connection: &Connection<A::Client>,
        query: &str,
        params: &[Value],
    ) -> TenantResult<QueryResponse> {
        self.ensure_open()?;
        self.inner
            .adapter
            .execute_query(connection.client(), query, params)
            .await
            .map_err(|e| e.with_tenant(connection.tenant_id()).with_operation("execute"))
    }

    /// Provision a tenant.
    pub async fn create_tenant(&self, tenant: impl AsRef<str>) -> TenantResult<()> {
        self.ensure_open()?;
        let tenant = TenantId::new(tenant.as_ref())?;
        self.inner.strategy.create_tenant(&tenant).await
    }

    /// Delete a tenant's data and drop its cached connection.
    pub async fn delete_tenant(&self, tenant: impl AsRef<str>) -> TenantResult<()> {
        self.ensure_open()?;
        let tenant = TenantId::new(tenant.as_ref())?;
        self.inner.strategy.delete_tenant(&tenant).await
    }

    /// Check whether a tenant exists.
    pub async fn tenant_exists(&self, tenant: impl AsRef<str>) -> TenantResult<bool> {
        self.ensure_open()?;
        let tenant = TenantId::new(tenant.as_ref())?;
        self.inner.strategy.tenant_exists(&tenant).await
    }

    /// List tenants, sorted.
    pub async fn list_tenants(&self) -> TenantResult<Vec<TenantId>> {
        self.ensure_open()?;
        self.inner.strategy.list_tenants().await
    }

    /// Evict expired cached connections now.
    pub async fn evict_expired(&self) -> usize {
        self.inner.strategy.evict_expired().await
    }

    /// Close every connection. Repeated calls do nothing.
    ///
    /// Every other operation fails with a connection error afterwards.
    pub async fn disconnect(&self) -> TenantResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Tenant database already disconnected");
            return Ok(());
        }
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }

        let stats = self.inner.strategy.cache_stats();
        self.inner.strategy.disconnect().await?;
        info!(
            cached = stats.entries,
            hits = stats.hits,
            misses = stats.misses,
            "Tenant database disconnected"
        );
        Ok(())
    }

    /// Check whether `disconnect` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The resolved configuration.
    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    /// The isolation strategy in use.
    pub fn strategy_kind(&self) -> StrategyKind {
        self.inner.strategy.kind()
    }

    /// The adapter family in use.
    pub fn adapter_kind(&self) -> AdapterKind {
        self.inner.config.adapter
    }

    /// The provider detected from the URL.
    pub fn provider(&self) -> Provider {
        self.inner.config.provider
    }

    /// The adapter.
    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    /// Connection cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.strategy.cache_stats()
    }

    fn ensure_open(&self) -> TenantResult<()> {
        if self.is_closed() {
            Err(TenantError::connection_closed("Tenant database")
                .with_help("Create a new TenantDatabase after disconnect"))
        } else {
            Ok(())
        }
    }
}

impl<A: Adapter> fmt::Debug for TenantDatabase<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantDatabase")
            .field("url", &self.inner.config.redacted_url())
            .field("strategy", &self.strategy_kind())
            .field("adapter", &self.adapter_kind())
            .field("provider", &self.provider())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Periodically evict expired connections until the database goes away.
///
/// Needs a running tokio runtime; without one no sweeper is started and
/// expiry happens lazily on lookup.
fn spawn_sweeper<A: Adapter>(inner: Weak<Inner<A>>, interval: Duration) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime; cache sweeping falls back to lookups");
        return None;
    };

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            let evicted = inner.strategy.evict_expired().await;
            if evicted > 0 {
                debug!(evicted, "Swept expired tenant connections");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::config::{CacheConfig, DatabaseLevelConfig, MapEnvSource};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn database(url: &str) -> TenantDatabase<MemoryAdapter> {
        let resolved = DatabaseConfig::new(url).resolve(&MapEnvSource::new()).unwrap();
        TenantDatabase::from_resolved(resolved, MemoryAdapter::open("memory://local/app").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_to_row_strategy() {
        let db = database("memory://local/app");
        assert_eq!(db.strategy_kind(), StrategyKind::Row);
        assert_eq!(db.adapter_kind(), AdapterKind::Document);
        assert_eq!(db.provider(), Provider::Memory);
    }

    #[tokio::test]
    async fn test_url_hint_selects_database_strategy() {
        let db = database("memory://local/app?tenant_strategy=database");
        assert_eq!(db.strategy_kind(), StrategyKind::Database);
        assert_eq!(db.config().url.as_str(), "memory://local/app");
    }

    #[tokio::test]
    async fn test_invalid_tenant_rejected_before_io() {
        let db = database("memory://local/app");
        db.adapter().set_available(false);

        let err = db.get_connection("bad tenant!").await.unwrap_err();
        assert!(err.is_validation_error());
        assert!(db.get_connection("").await.unwrap_err().is_validation_error());
        assert_eq!(db.adapter().stats().opened, 0);
    }

    #[tokio::test]
    async fn test_execute_adds_context_to_errors() {
        let db = database("memory://local/app");
        let conn = db.get_connection("acme").await.unwrap();

        let err = db.execute(&conn, "not json", &[]).await.unwrap_err();
        assert!(err.is_validation_error());
        assert_eq!(err.context.tenant.as_deref(), Some("acme"));
        assert_eq!(err.context.operation.as_deref(), Some("execute"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let db = database("memory://local/app");
        let conn = db.get_connection("acme").await.unwrap();

        db.disconnect().await.unwrap();
        db.disconnect().await.unwrap();
        assert!(db.is_closed());
        assert!(conn.is_closed());

        let err = db.get_connection("acme").await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(db.list_tenants().await.unwrap_err().is_connection_error());
        assert!(db.execute(&conn, "{}", &[]).await.unwrap_err().is_connection_error());
    }

    #[tokio::test]
    async fn test_adapter_kind_mismatch() {
        let resolved = DatabaseConfig::new("postgres://localhost/app")
            .resolve(&MapEnvSource::new())
            .unwrap();
        let err = TenantDatabase::from_resolved(resolved, MemoryAdapter::open("memory://local/app").unwrap())
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let db = database("memory://local/app");
        let other = db.clone();
        let _conn = db.get_connection("acme").await.unwrap();
        let _again = other.get_connection("acme").await.unwrap();

        assert_eq!(db.cache_stats().hits, 1);
        other.disconnect().await.unwrap();
        assert!(db.is_closed());
    }

    #[tokio::test]
    async fn test_lifecycle_passthroughs() {
        let resolved = DatabaseConfig::new("memory://local/app")
            .with_strategy(StrategyKind::Database)
            .with_database_config(DatabaseLevelConfig::default())
            .resolve(&MapEnvSource::new())
            .unwrap();
        let db = TenantDatabase::from_resolved(resolved, MemoryAdapter::open("memory://local/app").unwrap()).unwrap();

        db.create_tenant("acme").await.unwrap();
        assert!(db.tenant_exists("acme").await.unwrap());
        assert_eq!(db.list_tenants().await.unwrap(), vec![TenantId::new("acme").unwrap()]);

        let conn = db.get_connection("acme").await.unwrap();
        let inserted = db
            .execute(&conn, r#"{"op": "insert", "collection": "users", "documents": [{"n": "$1"}]}"#, &[json!(1)])
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);

        db.delete_tenant("acme").await.unwrap();
        assert!(!db.tenant_exists("acme").await.unwrap());
        assert!(db.tenant_exists("bad id").await.unwrap_err().is_validation_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_connections() {
        let resolved = DatabaseConfig::new("memory://local/app")
            .with_strategy(StrategyKind::Database)
            .with_database_config(DatabaseLevelConfig::default().with_auto_create())
            .with_cache_config(
                CacheConfig::default()
                    .with_idle_timeout(Duration::from_secs(10))
                    .with_sweep_interval(Duration::from_secs(5)),
            )
            .resolve(&MapEnvSource::new())
            .unwrap();
        let db = TenantDatabase::from_resolved(resolved, MemoryAdapter::open("memory://local/app").unwrap()).unwrap();

        let conn = db.get_connection("acme").await.unwrap();
        drop(conn);
        assert_eq!(db.cache_stats().entries, 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(db.cache_stats().entries, 0);
        assert_eq!(db.adapter().stats().open(), 0);
    }
}
