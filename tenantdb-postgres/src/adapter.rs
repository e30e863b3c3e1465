//! The PostgreSQL [`Adapter`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use tenantdb_core::adapter::ClientRegistry;
use tenantdb_core::config::{AdapterKind, Provider};
use tenantdb_core::tenant::validate_identifier;
use tenantdb_core::{Adapter, ConnectTarget, QueryResponse, TenantError, TenantId, TenantResult, TenantScope};
use tracing::{debug, info};

use crate::client::PgClient;
use crate::config::PgConfig;
use crate::error::PgError;

/// Adapter for PostgreSQL (and wire-compatible servers).
///
/// Every client is a `deadpool-postgres` pool over one database. Database
/// administration (`CREATE DATABASE`, `DROP DATABASE`, listing) runs on the
/// pool for the base URL.
pub struct PgAdapter {
    base: ConnectTarget,
    options: Map<String, Value>,
    registry: ClientRegistry<PgClient>,
}

impl PgAdapter {
    /// Create an adapter for the server at `base`.
    ///
    /// `options` are the pool options documented on
    /// [`PgConfig::from_target`]. They are validated here; nothing connects
    /// until the first client is requested.
    pub fn new(base: ConnectTarget, options: Map<String, Value>) -> TenantResult<Self> {
        PgConfig::from_target(&base, &options).map_err(TenantError::from)?;
        Ok(Self {
            base,
            options,
            registry: ClientRegistry::new(),
        })
    }

    /// Create an adapter from a `postgres://` URL with default options.
    pub fn from_url(url: &str) -> TenantResult<Self> {
        Self::new(ConnectTarget::parse(url)?, Map::new())
    }

    /// The base target.
    pub fn base(&self) -> &ConnectTarget {
        &self.base
    }

    async fn open_client(&self, target: &ConnectTarget) -> TenantResult<PgClient> {
        let config = PgConfig::from_target(target, &self.options)?;
        let pool = config.build_pool()?;

        // Fail here rather than on first use when the database is unreachable.
        let conn = pool.get().await.map_err(PgError::from)?;
        drop(conn);

        let client = PgClient::new(self.registry.next_id(), pool, config.database);
        debug!(database = %client.database(), client_id = client.id, "Opened PostgreSQL client");
        Ok(client)
    }

    async fn admin(&self) -> TenantResult<PgClient> {
        self.connect(&self.base).await
    }
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name.
pub fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

#[async_trait]
impl Adapter for PgAdapter {
    type Client = PgClient;

    fn kind(&self) -> AdapterKind {
        AdapterKind::Relational
    }

    fn detect_provider(&self) -> Provider {
        Provider::detect(self.base.url())
    }

    async fn connect(&self, target: &ConnectTarget) -> TenantResult<PgClient> {
        self.registry
            .get_or_open(target.key(), || self.open_client(target))
            .await
    }

    async fn disconnect(&self) -> TenantResult<()> {
        let clients = self.registry.drain();
        let count = clients.len();
        for client in clients {
            client.close();
        }
        if count > 0 {
            info!(clients = count, "Closed PostgreSQL clients");
        }
        Ok(())
    }

    async fn create_client(&self, target: &ConnectTarget) -> TenantResult<PgClient> {
        let client = self.open_client(target).await?;
        self.registry.track(client.id, client.clone());
        Ok(client)
    }

    async fn close_client(&self, client: PgClient) -> TenantResult<()> {
        self.registry.untrack(client.id);
        client.close();
        debug!(database = %client.database(), client_id = client.id, "Closed PostgreSQL client");
        Ok(())
    }

    async fn execute_query(
        &self,
        client: &PgClient,
        query: &str,
        params: &[Value],
    ) -> TenantResult<QueryResponse> {
        client.execute(query, params).await
    }

    async fn create_database(&self, name: &str) -> TenantResult<()> {
        validate_identifier("database name", name)?;
        let admin = self.admin().await?;
        admin
            .batch_unscoped(&format!("CREATE DATABASE {}", quote_ident(name)))
            .await?;
        info!(database = name, "Created PostgreSQL database");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> TenantResult<()> {
        validate_identifier("database name", name)?;
        let admin = self.admin().await?;
        admin
            .batch_unscoped(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)))
            .await?;
        info!(database = name, "Dropped PostgreSQL database");
        Ok(())
    }

    async fn list_databases(&self) -> TenantResult<Vec<String>> {
        let admin = self.admin().await?;
        let rows = admin
            .query_unscoped(
                "SELECT datname::text FROM pg_database WHERE NOT datistemplate ORDER BY datname",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(|e| PgError::from(e).into()))
            .collect()
    }

    fn apply_tenant_middleware(&self, client: &PgClient, scope: &TenantScope) -> PgClient {
        client.scoped(scope)
    }

    async fn tenant_tables(&self, client: &PgClient, column: &str) -> TenantResult<Vec<String>> {
        let rows = client
            .query_unscoped(
                "SELECT c.table_schema::text, c.table_name::text \
                 FROM information_schema.columns c \
                 JOIN information_schema.tables t \
                   ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
                 WHERE c.column_name::text = $1 \
                   AND t.table_type = 'BASE TABLE' \
                   AND c.table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY 1, 2",
                &[&column],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let schema: String = row.try_get(0).map_err(PgError::from)?;
                let table: String = row.try_get(1).map_err(PgError::from)?;
                Ok(if schema == "public" {
                    table
                } else {
                    format!("{}.{}", schema, table)
                })
            })
            .collect()
    }

    async fn delete_tenant_rows(
        &self,
        client: &PgClient,
        table: &str,
        column: &str,
        tenant: &TenantId,
    ) -> TenantResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {}::text = $1",
            quote_table(table),
            quote_ident(column)
        );
        let deleted = client.execute_unscoped(&sql, &[&tenant.as_str()]).await?;
        debug!(tenant = %tenant, table = table, deleted, "Deleted tenant rows");
        Ok(deleted)
    }

    async fn distinct_tenants(
        &self,
        client: &PgClient,
        table: &str,
        column: &str,
    ) -> TenantResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {col}::text FROM {table} WHERE {col} IS NOT NULL",
            col = quote_ident(column),
            table = quote_table(table)
        );
        let rows = client.query_unscoped(&sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(|e| PgError::from(e).into()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("tenant_acme"), "\"tenant_acme\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_table("billing.invoices"), "\"billing\".\"invoices\"");
    }

    #[test]
    fn test_new_validates_options() {
        let base = ConnectTarget::parse("postgres://localhost/app").unwrap();
        let mut options = Map::new();
        options.insert("max_connections".into(), json!(-1));
        let err = PgAdapter::new(base, options).err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_from_url_rejects_other_schemes() {
        assert!(PgAdapter::from_url("mongodb://localhost/app").is_err());
        assert!(PgAdapter::from_url("not a url").is_err());
    }

    #[test]
    fn test_kind_and_provider() {
        let adapter = PgAdapter::from_url("postgres://localhost:26257/app").unwrap();
        assert_eq!(adapter.kind(), AdapterKind::Relational);
        assert_eq!(adapter.detect_provider(), Provider::CockroachDb);
    }

    #[tokio::test]
    async fn test_invalid_database_names_rejected_before_io() {
        let adapter = PgAdapter::from_url("postgres://localhost:1/app").unwrap();
        let err = adapter.create_database("x\"; DROP DATABASE app; --").await.unwrap_err();
        assert!(err.is_validation_error());
        let err = adapter.drop_database("").await.unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_disconnect_without_clients() {
        let adapter = PgAdapter::from_url("postgres://localhost:1/app").unwrap();
        adapter.disconnect().await.unwrap();
        adapter.disconnect().await.unwrap();
    }
}
