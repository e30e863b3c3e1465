//! Pooled PostgreSQL client handles.

use std::fmt;

use deadpool_postgres::Pool;
use serde_json::Value;
use tenantdb_core::{QueryResponse, TenantError, TenantResult, TenantScope};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::error::PgError;
use crate::rewrite::scope_statement;
use crate::types::{row_to_json, to_sql_params};

/// A handle onto one database's connection pool.
///
/// Cloning is cheap; clones share the pool. A scoped handle (see
/// [`PgAdapter`](crate::PgAdapter)) shares the pool with the handle it was
/// derived from and rewrites every statement for its tenant.
#[derive(Clone)]
pub struct PgClient {
    pub(crate) id: u64,
    pool: Pool,
    database: String,
    scope: Option<TenantScope>,
}

impl PgClient {
    pub(crate) fn new(id: u64, pool: Pool, database: impl Into<String>) -> Self {
        Self {
            id,
            pool,
            database: database.into(),
            scope: None,
        }
    }

    pub(crate) fn scoped(&self, scope: &TenantScope) -> Self {
        Self {
            scope: Some(scope.clone()),
            ..self.clone()
        }
    }

    /// The database this client connects to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The tenant scope, if this client is scoped.
    pub fn scope(&self) -> Option<&TenantScope> {
        self.scope.as_ref()
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Check if the pool was closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub(crate) fn close(&self) {
        self.pool.close();
    }

    /// Run a statement, rewriting it first when the client is scoped.
    ///
    /// Statements that return columns come back as rows; anything else
    /// reports the affected row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> TenantResult<QueryResponse> {
        if self.is_closed() {
            return Err(TenantError::connection_closed(format!(
                "PostgreSQL client for '{}'",
                self.database
            )));
        }

        let scoped;
        let (sql, params) = match &self.scope {
            Some(scope) => {
                scoped = scope_statement(sql, params, scope).map_err(|e| e.with_tenant(scope.tenant()))?;
                (scoped.sql.as_str(), scoped.params.as_slice())
            }
            None => (sql, params),
        };

        let conn = self.pool.get().await.map_err(PgError::from)?;
        let statement = conn.prepare_cached(sql).await.map_err(PgError::from)?;
        let bound = to_sql_params(statement.params(), params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        debug!(database = %self.database, scoped = self.scope.is_some(), "Executing PostgreSQL statement");

        if statement.columns().is_empty() {
            let affected = conn.execute(&statement, &refs).await.map_err(PgError::from)?;
            Ok(QueryResponse::affected(affected))
        } else {
            let rows = conn.query(&statement, &refs).await.map_err(PgError::from)?;
            let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()?;
            let count = rows.len() as u64;
            Ok(QueryResponse {
                rows,
                rows_affected: count,
            })
        }
    }

    /// Run an administrative query, bypassing any scope.
    pub(crate) async fn query_unscoped(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> TenantResult<Vec<Row>> {
        let conn = self.pool.get().await.map_err(PgError::from)?;
        Ok(conn.query(sql, params).await.map_err(PgError::from)?)
    }

    /// Run an administrative statement, bypassing any scope.
    pub(crate) async fn execute_unscoped(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> TenantResult<u64> {
        let conn = self.pool.get().await.map_err(PgError::from)?;
        Ok(conn.execute(sql, params).await.map_err(PgError::from)?)
    }

    /// Run a statement through the simple query protocol, outside any
    /// transaction block.
    pub(crate) async fn batch_unscoped(&self, sql: &str) -> TenantResult<()> {
        let conn = self.pool.get().await.map_err(PgError::from)?;
        Ok(conn.batch_execute(sql).await.map_err(PgError::from)?)
    }
}

impl fmt::Debug for PgClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.pool.status();
        f.debug_struct("PgClient")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("tenant", &self.scope.as_ref().map(|s| s.tenant().as_str()))
            .field("pool_size", &status.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}
