//! The MongoDB [`Adapter`].

use async_trait::async_trait;
use mongodb::Client;
use serde_json::{Map, Value};
use tenantdb_core::adapter::ClientRegistry;
use tenantdb_core::command::{Document, DocumentCommand};
use tenantdb_core::config::{AdapterKind, Provider};
use tenantdb_core::tenant::validate_identifier;
use tenantdb_core::{
    Adapter, ConnectTarget, ErrorCode, QueryResponse, TenantError, TenantId, TenantResult, TenantScope,
};
use tracing::{debug, info};

use crate::client::{MongoClient, field_filter};
use crate::config::MongoConfig;
use crate::error::MongoError;

/// Collection created in every database this adapter creates.
///
/// MongoDB only materializes a database once it holds data; the marker makes
/// a fresh tenant database visible to `list_databases` right away.
pub const MARKER_COLLECTION: &str = "_tenantdb";

/// Adapter for MongoDB.
///
/// Each client is a driver `Client` bound to one database name. Database
/// administration runs on the client for the base URL.
pub struct MongoAdapter {
    base: ConnectTarget,
    options: Map<String, Value>,
    registry: ClientRegistry<MongoClient>,
}

impl MongoAdapter {
    /// Create an adapter for the deployment at `base`.
    ///
    /// `options` are documented on [`MongoConfig::from_target`].
    pub fn new(base: ConnectTarget, options: Map<String, Value>) -> TenantResult<Self> {
        MongoConfig::from_target(&base, &options).map_err(TenantError::from)?;
        Ok(Self {
            base,
            options,
            registry: ClientRegistry::new(),
        })
    }

    /// Create an adapter from a `mongodb://` URL with default options.
    pub fn from_url(url: &str) -> TenantResult<Self> {
        Self::new(ConnectTarget::parse(url)?, Map::new())
    }

    /// The base target.
    pub fn base(&self) -> &ConnectTarget {
        &self.base
    }

    async fn open_client(&self, target: &ConnectTarget) -> TenantResult<MongoClient> {
        let config = MongoConfig::from_target(target, &self.options)?;
        let options = config.to_client_options().await?;
        let client = Client::with_options(options).map_err(MongoError::from)?;
        let client = MongoClient::new(self.registry.next_id(), client, config.database);

        if let Err(e) = client.ping().await {
            client.close().await;
            return Err(e.into());
        }

        debug!(database = %client.database(), client_id = client.id, "Opened MongoDB client");
        Ok(client)
    }

    async fn admin(&self) -> TenantResult<MongoClient> {
        self.connect(&self.base).await
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    type Client = MongoClient;

    fn kind(&self) -> AdapterKind {
        AdapterKind::Document
    }

    fn detect_provider(&self) -> Provider {
        Provider::detect(self.base.url())
    }

    async fn connect(&self, target: &ConnectTarget) -> TenantResult<MongoClient> {
        self.registry
            .get_or_open(target.key(), || self.open_client(target))
            .await
    }

    async fn disconnect(&self) -> TenantResult<()> {
        let clients = self.registry.drain();
        let count = clients.len();
        for client in clients {
            client.close().await;
        }
        if count > 0 {
            info!(clients = count, "Closed MongoDB clients");
        }
        Ok(())
    }

    async fn create_client(&self, target: &ConnectTarget) -> TenantResult<MongoClient> {
        let client = self.open_client(target).await?;
        self.registry.track(client.id, client.clone());
        Ok(client)
    }

    async fn close_client(&self, client: MongoClient) -> TenantResult<()> {
        self.registry.untrack(client.id);
        client.close().await;
        debug!(database = %client.database(), client_id = client.id, "Closed MongoDB client");
        Ok(())
    }

    async fn execute_query(
        &self,
        client: &MongoClient,
        query: &str,
        params: &[Value],
    ) -> TenantResult<QueryResponse> {
        client.execute(query, params).await
    }

    async fn create_database(&self, name: &str) -> TenantResult<()> {
        validate_identifier("database name", name)?;
        let admin = self.admin().await?;
        let existing = admin
            .inner()
            .list_database_names(None, None)
            .await
            .map_err(MongoError::from)?;
        if existing.iter().any(|db| db == name) {
            return Err(TenantError::new(
                ErrorCode::TenantAlreadyExists,
                format!("Database '{}' already exists", name),
            ));
        }

        admin
            .inner()
            .database(name)
            .create_collection(MARKER_COLLECTION, None)
            .await
            .map_err(MongoError::from)?;
        info!(database = name, "Created MongoDB database");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> TenantResult<()> {
        validate_identifier("database name", name)?;
        let admin = self.admin().await?;
        admin
            .inner()
            .database(name)
            .drop(None)
            .await
            .map_err(MongoError::from)?;
        info!(database = name, "Dropped MongoDB database");
        Ok(())
    }

    async fn list_databases(&self) -> TenantResult<Vec<String>> {
        let admin = self.admin().await?;
        Ok(admin
            .inner()
            .list_database_names(None, None)
            .await
            .map_err(MongoError::from)?)
    }

    fn apply_tenant_middleware(&self, client: &MongoClient, scope: &TenantScope) -> MongoClient {
        client.scoped(scope)
    }

    async fn tenant_tables(&self, client: &MongoClient, column: &str) -> TenantResult<Vec<String>> {
        let mut names = client
            .handle()
            .list_collection_names(None)
            .await
            .map_err(MongoError::from)?;
        names.retain(|name| name != MARKER_COLLECTION && !name.starts_with("system."));
        names.sort();

        let mut tables = Vec::new();
        for name in names {
            if client.count_with_field(&name, column).await? > 0 {
                tables.push(name);
            }
        }
        Ok(tables)
    }

    async fn delete_tenant_rows(
        &self,
        client: &MongoClient,
        table: &str,
        column: &str,
        tenant: &TenantId,
    ) -> TenantResult<u64> {
        let response = client
            .run(DocumentCommand::Delete {
                collection: table.to_string(),
                filter: field_filter(column, tenant.as_str()),
            })
            .await?;
        debug!(tenant = %tenant, collection = table, deleted = response.rows_affected, "Deleted tenant documents");
        Ok(response.rows_affected)
    }

    async fn distinct_tenants(
        &self,
        client: &MongoClient,
        table: &str,
        column: &str,
    ) -> TenantResult<Vec<String>> {
        let response = client
            .run(DocumentCommand::Distinct {
                collection: table.to_string(),
                field: column.to_string(),
                filter: Document::new(),
            })
            .await?;
        Ok(response
            .rows
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_validates_options() {
        let base = ConnectTarget::parse("mongodb://localhost/app").unwrap();
        let mut options = Map::new();
        options.insert("max_pool_size".into(), json!("lots"));
        let err = MongoAdapter::new(base, options).err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_from_url_rejects_other_schemes() {
        assert!(MongoAdapter::from_url("postgres://localhost/app").is_err());
        assert!(MongoAdapter::from_url("::").is_err());
    }

    #[test]
    fn test_kind_and_provider() {
        let adapter = MongoAdapter::from_url("mongodb://localhost:27017/app").unwrap();
        assert_eq!(adapter.kind(), AdapterKind::Document);
        assert_eq!(adapter.detect_provider(), Provider::MongoDb);

        let atlas = MongoAdapter::from_url("mongodb://cluster0.abcde.mongodb.net/app").unwrap();
        assert_eq!(atlas.detect_provider(), Provider::MongoDbAtlas);
    }

    #[tokio::test]
    async fn test_invalid_database_names_rejected_before_io() {
        let adapter = MongoAdapter::from_url("mongodb://localhost:1/app").unwrap();
        let err = adapter.create_database("bad.name").await.unwrap_err();
        assert!(err.is_validation_error());
        let err = adapter.drop_database("").await.unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_disconnect_without_clients() {
        let adapter = MongoAdapter::from_url("mongodb://localhost:1/app").unwrap();
        adapter.disconnect().await.unwrap();
    }
}
