//! The adapter contract: one uniform interface over a concrete storage client.
//!
//! An [`Adapter`] knows how to open and close clients for one family of
//! backing stores, pass raw queries through, administer logical databases
//! and wrap a client so that it only ever sees one tenant's rows.
//!
//! Strategies are written against this trait only. The workspace ships a
//! PostgreSQL adapter (`tenantdb-postgres`), a MongoDB adapter
//! (`tenantdb-mongodb`) and the in-process [`MemoryAdapter`].

mod memory;
mod registry;

pub use memory::{MemoryAdapter, MemoryClient, MemoryStats};
pub use registry::ClientRegistry;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::config::{AdapterKind, Provider};
use crate::error::{TenantError, TenantResult, redact};
use crate::tenant::{TenantId, TenantScope};

/// Where a client connects to: a URL plus the logical database it selects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    url: Url,
    database: Option<String>,
}

impl ConnectTarget {
    /// Build a target from a parsed URL. The database is taken from the path.
    pub fn new(url: Url) -> Self {
        let database = Some(url.path().trim_start_matches('/'))
            .filter(|path| !path.is_empty())
            .map(str::to_string);
        Self { url, database }
    }

    /// Parse a target from a URL string.
    pub fn parse(raw: &str) -> TenantResult<Self> {
        let url = Url::parse(raw).map_err(|e| TenantError::invalid_url(raw, e))?;
        Ok(Self::new(url))
    }

    /// The same server, selecting another logical database.
    pub fn for_database(&self, name: &str) -> Self {
        let mut url = self.url.clone();
        url.set_path(&format!("/{}", name));
        Self {
            url,
            database: Some(name.to_string()),
        }
    }

    /// The connection URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The logical database, if the URL selects one.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Key identifying this target in client registries.
    pub fn key(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact(self.url.as_str()))
    }
}

/// The result of a raw query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    /// Returned rows or documents, as JSON objects.
    pub rows: Vec<Value>,
    /// Rows or documents written by the statement.
    pub rows_affected: u64,
}

impl QueryResponse {
    /// A response carrying rows.
    pub fn with_rows(rows: Vec<Value>) -> Self {
        Self {
            rows,
            rows_affected: 0,
        }
    }

    /// A response for a write.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// The first row, if any.
    pub fn first(&self) -> Option<&Value> {
        self.rows.first()
    }

    /// Check if the response has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Uniform interface over a concrete storage client.
///
/// `Client` is a cheap handle (usually a pool) that is safe to use from many
/// tasks at once. A tenant-scoped client returned by
/// [`apply_tenant_middleware`](Adapter::apply_tenant_middleware) is a new
/// handle over the same pool; the base client is never mutated.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// The client handle this adapter hands out.
    type Client: Clone + Send + Sync + 'static;

    /// The adapter family.
    fn kind(&self) -> AdapterKind;

    /// The provider behind this adapter's base URL. Diagnostics only.
    fn detect_provider(&self) -> Provider;

    /// Open or reuse the client for `target`.
    ///
    /// Idempotent per target: concurrent calls for one target share one
    /// underlying open.
    async fn connect(&self, target: &ConnectTarget) -> TenantResult<Self::Client>;

    /// Close every client this adapter opened. Safe to call repeatedly.
    async fn disconnect(&self) -> TenantResult<()>;

    /// Open a new client for `target`, independent of the shared registry.
    async fn create_client(&self, target: &ConnectTarget) -> TenantResult<Self::Client>;

    /// Close a client opened by [`create_client`](Adapter::create_client).
    async fn close_client(&self, client: Self::Client) -> TenantResult<()>;

    /// Run a raw query on `client`.
    ///
    /// Relational adapters take SQL with `$n` placeholders; document adapters
    /// take a JSON command. Only a tenant-scoped client rewrites the query.
    async fn execute_query(
        &self,
        client: &Self::Client,
        query: &str,
        params: &[Value],
    ) -> TenantResult<QueryResponse>;

    /// Create a logical database.
    async fn create_database(&self, name: &str) -> TenantResult<()>;

    /// Drop a logical database. Dropping a missing database is not an error.
    async fn drop_database(&self, name: &str) -> TenantResult<()>;

    /// List logical databases on the server.
    async fn list_databases(&self) -> TenantResult<Vec<String>>;

    /// Wrap `client` so that every query is confined to `scope`'s tenant.
    fn apply_tenant_middleware(&self, client: &Self::Client, scope: &TenantScope) -> Self::Client;

    /// Tables or collections carrying `column`.
    async fn tenant_tables(&self, client: &Self::Client, column: &str) -> TenantResult<Vec<String>>;

    /// Delete every row of `table` belonging to `tenant`. Returns the count.
    async fn delete_tenant_rows(
        &self,
        client: &Self::Client,
        table: &str,
        column: &str,
        tenant: &TenantId,
    ) -> TenantResult<u64>;

    /// Distinct non-null values of `column` in `table`.
    async fn distinct_tenants(
        &self,
        client: &Self::Client,
        table: &str,
        column: &str,
    ) -> TenantResult<Vec<String>>;
}
