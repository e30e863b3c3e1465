//! # tenantdb-mongodb
//!
//! MongoDB adapter for tenantdb.
//!
//! Queries are JSON [`DocumentCommand`](tenantdb_core::command::DocumentCommand)s
//! run through the official driver:
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tenantdb_core::{DatabaseConfig, TenantDatabase};
//! use tenantdb_mongodb::MongoAdapter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let url = "mongodb://localhost:27017/app";
//!     let db = TenantDatabase::with_adapter(DatabaseConfig::new(url), MongoAdapter::from_url(url)?)?;
//!
//!     let acme = db.get_connection("acme").await?;
//!     db.execute(
//!         &acme,
//!         r#"{"op": "insert", "collection": "users", "documents": [{"name": "$1"}]}"#,
//!         &[json!("Ada")],
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! Results come back as relaxed extended JSON, so an `_id` reads as
//! `{"$oid": "..."}`.

pub mod adapter;
pub mod client;
pub mod config;
pub mod convert;
pub mod error;

pub use adapter::{MARKER_COLLECTION, MongoAdapter};
pub use client::MongoClient;
pub use config::MongoConfig;
pub use error::{MongoError, MongoResult};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::adapter::MongoAdapter;
    pub use crate::client::MongoClient;
    pub use crate::config::MongoConfig;
    pub use crate::error::{MongoError, MongoResult};
}
