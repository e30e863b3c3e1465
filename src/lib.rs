//! # tenantdb
//!
//! A multi-tenant database access layer.
//!
//! Given a tenant identifier, tenantdb hands out a connection that only sees
//! that tenant's data, either by filtering a shared schema on a tenant column
//! (row-level isolation) or by giving every tenant its own logical database
//! (database-level isolation). PostgreSQL and MongoDB are supported behind
//! one contract.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tenantdb::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> TenantResult<()> {
//!     let db = create_db(DatabaseConfig::new("postgres://localhost/app"))?;
//!
//!     let acme = db.get_connection("acme").await?;
//!     db.execute(&acme, "INSERT INTO orders (id, total) VALUES ($1, $2)", &[json!(1), json!(10)])
//!         .await?;
//!
//!     // Only acme's orders are visible here.
//!     let orders = db.execute(&acme, "SELECT id, total FROM orders", &[]).await?;
//!     println!("{:?}", orders.rows);
//!
//!     db.disconnect().await
//! }
//! ```
//!
//! ## Choosing the adapter and strategy
//!
//! The adapter follows the URL scheme (`postgres`, `postgresql`, `mongodb`,
//! `mongodb+srv`, or `memory` for the in-process store). The strategy is the
//! explicit one, else the `tenant_strategy` URL parameter, else the
//! `TENANTDB_STRATEGY` environment variable, else row-level.
//!
//! ```rust
//! use tenantdb::prelude::*;
//!
//! let db = create_db(DatabaseConfig::new("memory://local/app?tenant_strategy=database")).unwrap();
//! assert_eq!(db.strategy_kind(), StrategyKind::Database);
//! assert_eq!(db.adapter_kind(), AdapterKind::Document);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod any;

/// The PostgreSQL adapter.
pub mod postgres {
    pub use tenantdb_postgres::*;
}

/// The MongoDB adapter.
pub mod mongodb {
    pub use tenantdb_mongodb::*;
}

/// Axum integration.
#[cfg(feature = "axum")]
#[cfg_attr(docsrs, doc(cfg(feature = "axum")))]
pub mod axum {
    pub use tenantdb_axum::*;
}

pub use tenantdb_core::{adapter, cache, command, config, error, logging, middleware, strategy, tenant};

pub use any::{AnyAdapter, AnyClient};
pub use tenantdb_core::{
    Adapter, AdapterKind, CacheConfig, Connection, DatabaseConfig, DatabaseLevelConfig, ErrorCode, ErrorKind,
    MemoryAdapter, Provider, QueryResponse, RowLevelConfig, StrategyKind, TenantContext, TenantDatabase,
    TenantError, TenantId, TenantMiddleware, TenantResult,
};

use tenantdb_core::ConnectTarget;
use tenantdb_core::config::{EnvSource, StdEnvSource};
use tracing::debug;

/// Build a [`TenantDatabase`] for `config`, picking the adapter from the URL.
///
/// Nothing connects yet; the first [`get_connection`](TenantDatabase::get_connection)
/// does.
pub fn create_db(config: DatabaseConfig) -> TenantResult<TenantDatabase<AnyAdapter>> {
    create_db_with_env(config, &StdEnvSource)
}

/// [`create_db`] with an explicit environment for strategy detection.
pub fn create_db_with_env(config: DatabaseConfig, env: &dyn EnvSource) -> TenantResult<TenantDatabase<AnyAdapter>> {
    let resolved = config.resolve(env)?;
    let adapter = AnyAdapter::for_target(ConnectTarget::new(resolved.url.clone()), resolved.config.options.clone())?;
    debug!(adapter = adapter.name(), strategy = %resolved.strategy, "Selected adapter");
    TenantDatabase::from_resolved(resolved, adapter)
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::any::{AnyAdapter, AnyClient};
    pub use crate::{create_db, create_db_with_env};
    pub use tenantdb_core::prelude::*;
    pub use tenantdb_core::{Provider, StrategyKind};
}
