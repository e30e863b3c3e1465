//! # tenantdb-core
//!
//! Tenant resolution, isolation strategies and connection caching.
//!
//! This crate holds everything that does not depend on a concrete database
//! driver:
//! - The [`Adapter`](adapter::Adapter) contract drivers implement, plus an
//!   in-process [`MemoryAdapter`](adapter::MemoryAdapter)
//! - Row-level and database-level isolation [strategies](strategy)
//! - The per-strategy [`ConnectionCache`](cache::ConnectionCache)
//! - The [`TenantDatabase`] facade
//! - HTTP-agnostic [request middleware](middleware)
//!
//! ## Getting a tenant connection
//!
//! ```rust
//! use tenantdb_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> TenantResult<()> {
//! let config = DatabaseConfig::new("memory://local/app?tenant_strategy=database")
//!     .with_database_config(DatabaseLevelConfig::default().with_auto_create());
//! let db = TenantDatabase::with_adapter(config, MemoryAdapter::open("memory://local/app")?)?;
//!
//! let acme = db.get_connection("acme").await?;
//! assert_eq!(acme.database(), "tenant_acme");
//! assert_eq!(db.list_tenants().await?, vec![TenantId::new("acme")?]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Tenant identifiers
//!
//! Identifiers end up in database names and filters, so they are checked
//! before any I/O: 1 to 63 ASCII letters, digits, `-` or `_`.
//!
//! ```rust
//! use tenantdb_core::TenantId;
//!
//! assert!(TenantId::new("acme-eu_1").is_ok());
//! assert!(TenantId::new("acme; DROP DATABASE").is_err());
//! ```
//!
//! ## Errors
//!
//! Every failure is a [`TenantError`] with a code, a coarse [`ErrorKind`] and
//! the tenant and operation it happened in.

pub mod adapter;
pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod strategy;
pub mod tenant;

pub use adapter::{Adapter, ConnectTarget, MemoryAdapter, MemoryClient, QueryResponse};
pub use cache::{CacheStats, Connection, ConnectionCache};
pub use client::TenantDatabase;
pub use config::{
    AdapterKind, CacheConfig, ConfigLoader, DatabaseConfig, DatabaseLevelConfig, Provider, ResolvedConfig,
    RowLevelConfig, StrategyKind,
};
pub use error::{ErrorCode, ErrorContext, ErrorKind, TenantError, TenantResult};
pub use middleware::{TenantContext, TenantMiddleware};
pub use strategy::Strategy;
pub use tenant::{TenantId, TenantScope};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::adapter::{Adapter, ConnectTarget, MemoryAdapter, QueryResponse};
    pub use crate::cache::Connection;
    pub use crate::client::TenantDatabase;
    pub use crate::config::{
        AdapterKind, CacheConfig, DatabaseConfig, DatabaseLevelConfig, RowLevelConfig, StrategyKind,
    };
    pub use crate::error::{ErrorKind, TenantError, TenantResult};
    pub use crate::middleware::{SubdomainExtractor, TenantContext, TenantMiddleware};
    pub use crate::tenant::TenantId;
}
