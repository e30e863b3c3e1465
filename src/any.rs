//! An adapter chosen at runtime from the URL scheme.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tenantdb_core::config::{AdapterKind, Provider};
use tenantdb_core::{
    Adapter, ConnectTarget, MemoryAdapter, MemoryClient, QueryResponse, TenantError, TenantId, TenantResult,
    TenantScope,
};
use tenantdb_mongodb::{MongoAdapter, MongoClient};
use tenantdb_postgres::{PgAdapter, PgClient};

/// One of the supported adapters.
pub enum AnyAdapter {
    /// PostgreSQL.
    Postgres(PgAdapter),
    /// MongoDB.
    Mongo(MongoAdapter),
    /// The in-process store.
    Memory(MemoryAdapter),
}

/// A client handed out by [`AnyAdapter`].
#[derive(Debug, Clone)]
pub enum AnyClient {
    /// PostgreSQL client.
    Postgres(PgClient),
    /// MongoDB client.
    Mongo(MongoClient),
    /// In-process client.
    Memory(MemoryClient),
}

impl AnyAdapter {
    /// Build the adapter serving `target`'s scheme.
    pub fn for_target(target: ConnectTarget, options: Map<String, Value>) -> TenantResult<Self> {
        match target.url().scheme() {
            "postgres" | "postgresql" => Ok(Self::Postgres(PgAdapter::new(target, options)?)),
            "mongodb" | "mongodb+srv" => Ok(Self::Mongo(MongoAdapter::new(target, options)?)),
            "memory" => Ok(Self::Memory(MemoryAdapter::new(target))),
            other => Err(TenantError::unsupported_scheme(other)),
        }
    }

    /// The provider name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Mongo(_) => "mongodb",
            Self::Memory(_) => "memory",
        }
    }
}

impl AnyClient {
    /// The database this client is bound to.
    pub fn database(&self) -> &str {
        match self {
            Self::Postgres(c) => c.database(),
            Self::Mongo(c) => c.database(),
            Self::Memory(c) => c.database(),
        }
    }

    /// The tenant scope, if this client is scoped.
    pub fn scope(&self) -> Option<&TenantScope> {
        match self {
            Self::Postgres(c) => c.scope(),
            Self::Mongo(c) => c.scope(),
            Self::Memory(c) => c.scope(),
        }
    }

    /// The PostgreSQL client, if this is one.
    pub fn as_postgres(&self) -> Option<&PgClient> {
        match self {
            Self::Postgres(c) => Some(c),
            _ => None,
        }
    }

    /// The MongoDB client, if this is one.
    pub fn as_mongo(&self) -> Option<&MongoClient> {
        match self {
            Self::Mongo(c) => Some(c),
            _ => None,
        }
    }
}

fn mismatch(adapter: &AnyAdapter) -> TenantError {
    TenantError::internal(format!("Client was not opened by the {} adapter", adapter.name()))
}

/// Run `$body` on the adapter and client of matching variants.
macro_rules! with_pair {
    ($self:expr, $client:expr, |$a:ident, $c:ident| $body:expr) => {
        match ($self, $client) {
            (AnyAdapter::Postgres($a), AnyClient::Postgres($c)) => $body,
            (AnyAdapter::Mongo($a), AnyClient::Mongo($c)) => $body,
            (AnyAdapter::Memory($a), AnyClient::Memory($c)) => $body,
            (adapter, _) => Err(mismatch(adapter)),
        }
    };
}

#[async_trait]
impl Adapter for AnyAdapter {
    type Client = AnyClient;

    fn kind(&self) -> AdapterKind {
        match self {
            Self::Postgres(a) => a.kind(),
            Self::Mongo(a) => a.kind(),
            Self::Memory(a) => a.kind(),
        }
    }

    fn detect_provider(&self) -> Provider {
        match self {
            Self::Postgres(a) => a.detect_provider(),
            Self::Mongo(a) => a.detect_provider(),
            Self::Memory(a) => a.detect_provider(),
        }
    }

    async fn connect(&self, target: &ConnectTarget) -> TenantResult<AnyClient> {
        match self {
            Self::Postgres(a) => a.connect(target).await.map(AnyClient::Postgres),
            Self::Mongo(a) => a.connect(target).await.map(AnyClient::Mongo),
            Self::Memory(a) => a.connect(target).await.map(AnyClient::Memory),
        }
    }

    async fn disconnect(&self) -> TenantResult<()> {
        match self {
            Self::Postgres(a) => a.disconnect().await,
            Self::Mongo(a) => a.disconnect().await,
            Self::Memory(a) => a.disconnect().await,
        }
    }

    async fn create_client(&self, target: &ConnectTarget) -> TenantResult<AnyClient> {
        match self {
            Self::Postgres(a) => a.create_client(target).await.map(AnyClient::Postgres),
            Self::Mongo(a) => a.create_client(target).await.map(AnyClient::Mongo),
            Self::Memory(a) => a.create_client(target).await.map(AnyClient::Memory),
        }
    }

    async fn close_client(&self, client: AnyClient) -> TenantResult<()> {
        with_pair!(self, client, |a, c| a.close_client(c).await)
    }

    async fn execute_query(&self, client: &AnyClient, query: &str, params: &[Value]) -> TenantResult<QueryResponse> {
        with_pair!(self, client, |a, c| a.execute_query(c, query, params).await)
    }

    async fn create_database(&self, name: &str) -> TenantResult<()> {
        match self {
            Self::Postgres(a) => a.create_database(name).await,
            Self::Mongo(a) => a.create_database(name).await,
            Self::Memory(a) => a.create_database(name).await,
        }
    }

    async fn drop_database(&self, name: &str) -> TenantResult<()> {
        match self {
            Self::Postgres(a) => a.drop_database(name).await,
            Self::Mongo(a) => a.drop_database(name).await,
            Self::Memory(a) => a.drop_database(name).await,
        }
    }

    async fn list_databases(&self) -> TenantResult<Vec<String>> {
        match self {
            Self::Postgres(a) => a.list_databases().await,
            Self::Mongo(a) => a.list_databases().await,
            Self::Memory(a) => a.list_databases().await,
        }
    }

    /// A client of another variant comes back unscoped; every query this
    /// adapter runs on it then fails.
    fn apply_tenant_middleware(&self, client: &AnyClient, scope: &TenantScope) -> AnyClient {
        match (self, client) {
            (Self::Postgres(a), AnyClient::Postgres(c)) => AnyClient::Postgres(a.apply_tenant_middleware(c, scope)),
            (Self::Mongo(a), AnyClient::Mongo(c)) => AnyClient::Mongo(a.apply_tenant_middleware(c, scope)),
            (Self::Memory(a), AnyClient::Memory(c)) => AnyClient::Memory(a.apply_tenant_middleware(c, scope)),
            _ => client.clone(),
        }
    }

    async fn tenant_tables(&self, client: &AnyClient, column: &str) -> TenantResult<Vec<String>> {
        with_pair!(self, client, |a, c| a.tenant_tables(c, column).await)
    }

    async fn delete_tenant_rows(
        &self,
        client: &AnyClient,
        table: &str,
        column: &str,
        tenant: &TenantId,
    ) -> TenantResult<u64> {
        with_pair!(self, client, |a, c| a.delete_tenant_rows(c, table, column, tenant).await)
    }

    async fn distinct_tenants(&self, client: &AnyClient, table: &str, column: &str) -> TenantResult<Vec<String>> {
        with_pair!(self, client, |a, c| a.distinct_tenants(c, table, column).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(url: &str) -> ConnectTarget {
        ConnectTarget::parse(url).unwrap()
    }

    #[test]
    fn test_for_target() {
        let pg = AnyAdapter::for_target(target("postgres://localhost/app"), Map::new()).unwrap();
        assert_eq!(pg.kind(), AdapterKind::Relational);
        assert_eq!(pg.name(), "postgres");

        let mongo = AnyAdapter::for_target(target("mongodb+srv://cluster0.example.net/app"), Map::new()).unwrap();
        assert_eq!(mongo.kind(), AdapterKind::Document);
        assert_eq!(mongo.detect_provider(), Provider::MongoDbAtlas);

        let memory = AnyAdapter::for_target(target("memory://local/app"), Map::new()).unwrap();
        assert_eq!(memory.detect_provider(), Provider::Memory);

        let err = AnyAdapter::for_target(target("mysql://localhost/app"), Map::new()).err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let adapter = AnyAdapter::for_target(target("memory://local/app"), Map::new()).unwrap();
        let client = adapter.connect(&target("memory://local/app")).await.unwrap();
        assert_eq!(client.database(), "app");
        assert!(client.as_postgres().is_none());

        adapter
            .execute_query(
                &client,
                r#"{"op": "insert", "collection": "users", "documents": [{"name": "$1"}]}"#,
                &[json!("Ada")],
            )
            .await
            .unwrap();
        let count = adapter
            .execute_query(&client, r#"{"op": "count", "collection": "users"}"#, &[])
            .await
            .unwrap();
        assert_eq!(count.rows, vec![json!({"count": 1})]);
    }

    #[tokio::test]
    async fn test_mismatched_client() {
        let memory = AnyAdapter::for_target(target("memory://local/app"), Map::new()).unwrap();
        let client = memory.connect(&target("memory://local/app")).await.unwrap();

        let other = AnyAdapter::for_target(target("postgres://localhost:1/app"), Map::new()).unwrap();
        let err = other
            .execute_query(&client, "SELECT 1", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tenantdb_core::ErrorKind::Internal);

        let scope = TenantScope::new(TenantId::new("acme").unwrap(), "tenant_id");
        let scoped = other.apply_tenant_middleware(&client, &scope);
        assert!(scoped.scope().is_none());
    }
}
