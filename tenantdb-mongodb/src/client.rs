//! MongoDB client handles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bson::{Bson, Document as BsonDocument, doc};
use futures::TryStreamExt;
use mongodb::options::FindOptions;
use mongodb::{Client, Collection, Database};
use serde_json::{Value, json};
use tenantdb_core::command::{Document, DocumentCommand};
use tenantdb_core::{QueryResponse, TenantError, TenantResult, TenantScope};
use tracing::debug;

use crate::convert::{bson_to_json, document_to_json, to_document};
use crate::error::{MongoError, MongoResult};

/// A handle onto one MongoDB database.
///
/// The driver pools connections itself; cloning shares the pool. Scoped
/// handles confine every command to their tenant before it is sent.
#[derive(Clone)]
pub struct MongoClient {
    pub(crate) id: u64,
    client: Client,
    database: String,
    scope: Option<TenantScope>,
    open: Arc<AtomicBool>,
}

impl MongoClient {
    pub(crate) fn new(id: u64, client: Client, database: impl Into<String>) -> Self {
        Self {
            id,
            client,
            database: database.into(),
            scope: None,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn scoped(&self, scope: &TenantScope) -> Self {
        Self {
            scope: Some(scope.clone()),
            ..self.clone()
        }
    }

    /// The database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The tenant scope, if this client is scoped.
    pub fn scope(&self) -> Option<&TenantScope> {
        self.scope.as_ref()
    }

    /// The underlying driver client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// The driver handle for this client's database.
    pub fn handle(&self) -> Database {
        self.client.database(&self.database)
    }

    /// Check if the client was closed.
    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }

    /// Close the client. Only the first call shuts the driver down.
    pub(crate) async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.client.clone().shutdown().await;
        }
    }

    pub(crate) fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.handle().collection(name)
    }

    /// Decode and run a JSON command, confining it to the tenant first when
    /// the client is scoped.
    pub async fn execute(&self, query: &str, params: &[Value]) -> TenantResult<QueryResponse> {
        if self.is_closed() {
            return Err(TenantError::connection_closed(format!(
                "MongoDB client for '{}'",
                self.database
            )));
        }

        let mut command = DocumentCommand::parse(query, params)?;
        if let Some(scope) = &self.scope {
            command = command.scoped(scope).map_err(|e| e.with_tenant(scope.tenant()))?;
        }

        debug!(
            database = %self.database,
            op = command.op(),
            collection = command.collection(),
            scoped = self.scope.is_some(),
            "Executing MongoDB command"
        );

        Ok(self.run(command).await?)
    }

    /// Run a decoded command as is.
    pub(crate) async fn run(&self, command: DocumentCommand) -> MongoResult<QueryResponse> {
        match command {
            DocumentCommand::Insert {
                collection,
                documents,
            } => {
                if documents.is_empty() {
                    return Ok(QueryResponse::affected(0));
                }
                let docs = documents.iter().map(to_document).collect::<MongoResult<Vec<_>>>()?;
                let result = self.collection(&collection).insert_many(docs, None).await?;
                Ok(QueryResponse::affected(result.inserted_ids.len() as u64))
            }
            DocumentCommand::Find {
                collection,
                filter,
                limit,
            } => {
                // The server reads a zero limit as "no limit".
                if limit == Some(0) {
                    return Ok(QueryResponse::with_rows(Vec::new()));
                }
                let mut options = FindOptions::default();
                options.limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

                let cursor = self
                    .collection(&collection)
                    .find(to_document(&filter)?, options)
                    .await?;
                let docs: Vec<BsonDocument> = cursor.try_collect().await?;
                Ok(QueryResponse::with_rows(docs.into_iter().map(document_to_json).collect()))
            }
            DocumentCommand::Update {
                collection,
                filter,
                set,
            } => {
                let filter = to_document(&filter)?;
                let coll = self.collection(&collection);
                // `$set` with no fields is rejected server-side; match only.
                if set.is_empty() {
                    let matched = coll.count_documents(filter, None).await?;
                    return Ok(QueryResponse::affected(matched));
                }
                let result = coll
                    .update_many(filter, doc! { "$set": to_document(&set)? }, None)
                    .await?;
                Ok(QueryResponse::affected(result.matched_count))
            }
            DocumentCommand::Delete { collection, filter } => {
                let result = self
                    .collection(&collection)
                    .delete_many(to_document(&filter)?, None)
                    .await?;
                Ok(QueryResponse::affected(result.deleted_count))
            }
            DocumentCommand::Count { collection, filter } => {
                let count = self
                    .collection(&collection)
                    .count_documents(to_document(&filter)?, None)
                    .await?;
                Ok(QueryResponse::with_rows(vec![json!({ "count": count })]))
            }
            DocumentCommand::Distinct {
                collection,
                field,
                filter,
            } => {
                let values = self
                    .collection(&collection)
                    .distinct(&field, to_document(&filter)?, None)
                    .await?;
                Ok(QueryResponse::with_rows(
                    values
                        .into_iter()
                        .filter(|v| !matches!(v, Bson::Null | Bson::Undefined))
                        .map(bson_to_json)
                        .collect(),
                ))
            }
        }
    }

    /// Count documents in `collection` that carry `field` at all.
    pub(crate) async fn count_with_field(&self, collection: &str, field: &str) -> MongoResult<u64> {
        let mut filter = BsonDocument::new();
        filter.insert(field, doc! { "$exists": true });
        Ok(self.collection(collection).count_documents(filter, None).await?)
    }

    pub(crate) async fn ping(&self) -> MongoResult<()> {
        self.handle().run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

impl fmt::Debug for MongoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoClient")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("tenant", &self.scope.as_ref().map(|s| s.tenant().as_str()))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An equality filter on one field.
pub(crate) fn field_filter(field: &str, value: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(field.to_string(), Value::String(value.to_string()));
    filter
}
