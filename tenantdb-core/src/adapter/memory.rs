//! In-process document adapter.
//!
//! Stores JSON documents in memory and speaks the same
//! [`DocumentCommand`](crate::command::DocumentCommand) language as the
//! MongoDB adapter. Useful for tests and local development: every adapter
//! operation works without a server, and outages or slow connects can be
//! simulated.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tracing::debug;

use super::{Adapter, ClientRegistry, ConnectTarget, QueryResponse};
use crate::command::{Document, DocumentCommand, check_filter, matches};
use crate::config::{AdapterKind, Provider};
use crate::error::{ErrorCode, TenantError, TenantResult};
use crate::tenant::{TenantId, TenantScope, validate_identifier};

const DEFAULT_DATABASE: &str = "default";

type Database = BTreeMap<String, Vec<Document>>;

#[derive(Default)]
struct Store {
    databases: RwLock<BTreeMap<String, Database>>,
}

/// A handle onto one in-memory database.
#[derive(Clone)]
pub struct MemoryClient {
    id: u64,
    store: Arc<Store>,
    database: String,
    scope: Option<TenantScope>,
    open: Arc<AtomicBool>,
}

impl MemoryClient {
    /// The database this client reads and writes.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The tenant scope, if this client is scoped.
    pub fn scope(&self) -> Option<&TenantScope> {
        self.scope.as_ref()
    }

    /// Check if the underlying client was closed.
    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    fn run(&self, command: DocumentCommand) -> QueryResponse {
        match command {
            DocumentCommand::Insert {
                collection,
                documents,
            } => {
                let count = documents.len() as u64;
                let mut databases = self.store.databases.write();
                databases
                    .entry(self.database.clone())
                    .or_default()
                    .entry(collection)
                    .or_default()
                    .extend(documents);
                QueryResponse::affected(count)
            }
            DocumentCommand::Find {
                collection,
                filter,
                limit,
            } => {
                let limit = limit.map_or(usize::MAX, |l| l as usize);
                let rows = self.read(&collection, |docs| {
                    docs.iter()
                        .filter(|doc| matches(doc, &filter))
                        .take(limit)
                        .map(|doc| Value::Object(doc.clone()))
                        .collect()
                });
                QueryResponse::with_rows(rows)
            }
            DocumentCommand::Update {
                collection,
                filter,
                set,
            } => {
                let mut databases = self.store.databases.write();
                let docs = databases
                    .get_mut(&self.database)
                    .and_then(|db| db.get_mut(&collection));
                let mut count = 0;
                for doc in docs.into_iter().flatten() {
                    if matches(doc, &filter) {
                        doc.extend(set.clone());
                        count += 1;
                    }
                }
                QueryResponse::affected(count)
            }
            DocumentCommand::Delete { collection, filter } => {
                let mut databases = self.store.databases.write();
                let docs = databases
                    .get_mut(&self.database)
                    .and_then(|db| db.get_mut(&collection));
                let count = match docs {
                    Some(docs) => {
                        let before = docs.len();
                        docs.retain(|doc| !matches(doc, &filter));
                        (before - docs.len()) as u64
                    }
                    None => 0,
                };
                QueryResponse::affected(count)
            }
            DocumentCommand::Count { collection, filter } => {
                let count = self.read(&collection, |docs| {
                    docs.iter().filter(|doc| matches(doc, &filter)).count()
                });
                QueryResponse::with_rows(vec![json!({ "count": count })])
            }
            DocumentCommand::Distinct {
                collection,
                field,
                filter,
            } => {
                let values = self.read(&collection, |docs| {
                    let mut values: Vec<Value> = Vec::new();
                    for value in docs
                        .iter()
                        .filter(|doc| matches(doc, &filter))
                        .filter_map(|doc| doc.get(&field))
                    {
                        if !value.is_null() && !values.contains(value) {
                            values.push(value.clone());
                        }
                    }
                    values
                });
                QueryResponse::with_rows(values)
            }
        }
    }

    fn read<T: Default>(&self, collection: &str, f: impl FnOnce(&[Document]) -> T) -> T {
        let databases = self.store.databases.read();
        databases
            .get(&self.database)
            .and_then(|db| db.get(collection))
            .map(|docs| f(docs))
            .unwrap_or_default()
    }
}

impl fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryClient")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("scope", &self.scope)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Counters describing client churn in a [`MemoryAdapter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Clients opened.
    pub opened: u64,
    /// Clients closed.
    pub closed: u64,
}

impl MemoryStats {
    /// Clients currently open.
    pub fn open(&self) -> u64 {
        self.opened - self.closed
    }
}

/// Document adapter backed by process memory.
pub struct MemoryAdapter {
    base: ConnectTarget,
    store: Arc<Store>,
    registry: ClientRegistry<MemoryClient>,
    available: AtomicBool,
    connect_latency: Mutex<Option<Duration>>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl MemoryAdapter {
    /// Create an adapter whose base URL is `target`.
    pub fn new(target: ConnectTarget) -> Self {
        Self {
            base: target,
            store: Arc::new(Store::default()),
            registry: ClientRegistry::new(),
            available: AtomicBool::new(true),
            connect_latency: Mutex::new(None),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    /// Create an adapter from a `memory://` URL.
    pub fn open(url: &str) -> TenantResult<Self> {
        let target = ConnectTarget::parse(url)?;
        if target.url().scheme() != "memory" {
            return Err(TenantError::unsupported_scheme(target.url().scheme()));
        }
        Ok(Self::new(target))
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    ///
    /// While unavailable every operation that would reach a server fails
    /// with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Delay every client open by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.connect_latency.lock() = Some(latency);
    }

    /// Client churn counters.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            opened: self.opened.load(Ordering::Acquire),
            closed: self.closed.load(Ordering::Acquire),
        }
    }

    fn ensure_available(&self) -> TenantResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TenantError::connection(format!("memory store {} is unavailable", self.base)))
        }
    }

    async fn open_client(&self, target: &ConnectTarget) -> TenantResult<MemoryClient> {
        let latency = *self.connect_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.ensure_available()?;

        let client = MemoryClient {
            id: self.registry.next_id(),
            store: Arc::clone(&self.store),
            database: target.database().unwrap_or(DEFAULT_DATABASE).to_string(),
            scope: None,
            open: Arc::new(AtomicBool::new(true)),
        };
        self.opened.fetch_add(1, Ordering::AcqRel);
        debug!(database = %client.database, client_id = client.id, "Opened memory client");
        Ok(client)
    }

    fn close(&self, client: &MemoryClient) {
        if client.close() {
            self.closed.fetch_add(1, Ordering::AcqRel);
            debug!(database = %client.database, client_id = client.id, "Closed memory client");
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    type Client = MemoryClient;

    fn kind(&self) -> AdapterKind {
        AdapterKind::Document
    }

    fn detect_provider(&self) -> Provider {
        Provider::detect(self.base.url())
    }

    async fn connect(&self, target: &ConnectTarget) -> TenantResult<MemoryClient> {
        self.registry
            .get_or_open(target.key(), || self.open_client(target))
            .await
    }

    async fn disconnect(&self) -> TenantResult<()> {
        for client in self.registry.drain() {
            self.close(&client);
        }
        Ok(())
    }

    async fn create_client(&self, target: &ConnectTarget) -> TenantResult<MemoryClient> {
        let client = self.open_client(target).await?;
        self.registry.track(client.id, client.clone());
        Ok(client)
    }

    async fn close_client(&self, client: MemoryClient) -> TenantResult<()> {
        self.registry.untrack(client.id);
        self.close(&client);
        Ok(())
    }

    async fn execute_query(
        &self,
        client: &MemoryClient,
        query: &str,
        params: &[Value],
    ) -> TenantResult<QueryResponse> {
        if client.is_closed() {
            return Err(TenantError::connection_closed("memory client"));
        }
        self.ensure_available()?;

        let mut command = DocumentCommand::parse(query, params)?;
        if let Some(scope) = client.scope() {
            command = command.scoped(scope)?;
        }
        if let Some(filter) = command.filter() {
            check_filter(filter)?;
        }
        debug!(
            database = %client.database,
            op = command.op(),
            collection = command.collection(),
            "Executing memory command"
        );
        Ok(client.run(command))
    }

    async fn create_database(&self, name: &str) -> TenantResult<()> {
        validate_identifier("database name", name)?;
        self.ensure_available()?;

        let mut databases = self.store.databases.write();
        if databases.contains_key(name) {
            return Err(TenantError::new(
                ErrorCode::TenantAlreadyExists,
                format!("Database '{}' already exists", name),
            ));
        }
        databases.insert(name.to_string(), Database::new());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> TenantResult<()> {
        validate_identifier("database name", name)?;
        self.ensure_available()?;
        self.store.databases.write().remove(name);
        Ok(())
    }

    async fn list_databases(&self) -> TenantResult<Vec<String>> {
        self.ensure_available()?;
        Ok(self.store.databases.read().keys().cloned().collect())
    }

    fn apply_tenant_middleware(&self, client: &MemoryClient, scope: &TenantScope) -> MemoryClient {
        MemoryClient {
            scope: Some(scope.clone()),
            ..client.clone()
        }
    }

    async fn tenant_tables(&self, client: &MemoryClient, column: &str) -> TenantResult<Vec<String>> {
        self.ensure_available()?;
        let databases = self.store.databases.read();
        Ok(databases
            .get(&client.database)
            .map(|db| {
                db.iter()
                    .filter(|(_, docs)| docs.iter().any(|doc| doc.contains_key(column)))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_tenant_rows(
        &self,
        client: &MemoryClient,
        table: &str,
        column: &str,
        tenant: &TenantId,
    ) -> TenantResult<u64> {
        self.ensure_available()?;
        let mut filter = Document::new();
        filter.insert(column.to_string(), Value::String(tenant.to_string()));
        let response = client.run(DocumentCommand::Delete {
            collection: table.to_string(),
            filter,
        });
        Ok(response.rows_affected)
    }

    async fn distinct_tenants(
        &self,
        client: &MemoryClient,
        table: &str,
        column: &str,
    ) -> TenantResult<Vec<String>> {
        self.ensure_available()?;
        let response = client.run(DocumentCommand::Distinct {
            collection: table.to_string(),
            field: column.to_string(),
            filter: Document::new(),
        });
        Ok(response
            .rows
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect())
    }
}
