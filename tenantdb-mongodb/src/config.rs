//! MongoDB connection configuration.

use std::time::Duration;

use mongodb::options::ClientOptions;
use serde_json::{Map, Value};
use tenantdb_core::ConnectTarget;

use crate::error::{MongoError, MongoResult};

/// Database used when the URL names none.
pub const DEFAULT_DATABASE: &str = "test";

/// MongoDB connection configuration for one logical database.
#[derive(Debug, Clone, PartialEq)]
pub struct MongoConfig {
    /// MongoDB connection URI, without the database path.
    pub uri: String,
    /// Database name.
    pub database: String,
    /// Application name (shown in server logs).
    pub app_name: Option<String>,
    /// Minimum connection pool size.
    pub min_pool_size: Option<u32>,
    /// Maximum connection pool size.
    pub max_pool_size: Option<u32>,
    /// Maximum idle time for connections.
    pub max_idle_time: Option<Duration>,
    /// Connection timeout.
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout.
    pub server_selection_timeout: Option<Duration>,
}

impl MongoConfig {
    /// Build a configuration from a connect target and the adapter options.
    ///
    /// | Option | Meaning |
    /// |--------|---------|
    /// | `app_name` | Application name |
    /// | `min_pool_size`, `max_pool_size` | Pool bounds (default max 10) |
    /// | `max_idle_time_secs` | Idle connection lifetime (default 300) |
    /// | `connect_timeout_secs` | Connect timeout (default 10) |
    /// | `server_selection_timeout_secs` | Server selection timeout (default 30) |
    pub fn from_target(target: &ConnectTarget, options: &Map<String, Value>) -> MongoResult<Self> {
        let url = target.url();
        if url.scheme() != "mongodb" && url.scheme() != "mongodb+srv" {
            return Err(MongoError::config(format!(
                "invalid scheme: expected 'mongodb' or 'mongodb+srv', got '{}'",
                url.scheme()
            )));
        }

        // The path would only set the default auth source; clients select
        // their database explicitly.
        let database = target.database().unwrap_or(DEFAULT_DATABASE).to_string();
        let mut server = url.clone();
        server.set_path("/");

        let secs = |key: &str| option_u64(options, key).map(|v| v.map(Duration::from_secs));

        Ok(Self {
            uri: server.to_string(),
            database,
            app_name: match options.get("app_name") {
                None | Some(Value::Null) => Some("tenantdb".to_string()),
                Some(Value::String(name)) => Some(name.clone()),
                Some(_) => return Err(MongoError::config("option 'app_name' must be a string")),
            },
            min_pool_size: option_u32(options, "min_pool_size")?,
            max_pool_size: option_u32(options, "max_pool_size")?.or(Some(10)),
            max_idle_time: secs("max_idle_time_secs")?.or(Some(Duration::from_secs(300))),
            connect_timeout: secs("connect_timeout_secs")?.or(Some(Duration::from_secs(10))),
            server_selection_timeout: secs("server_selection_timeout_secs")?
                .or(Some(Duration::from_secs(30))),
        })
    }

    /// Convert to MongoDB ClientOptions.
    pub async fn to_client_options(&self) -> MongoResult<ClientOptions> {
        let mut options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|e| MongoError::config(format!("failed to parse URI: {}", e)))?;

        if let Some(ref app_name) = self.app_name {
            options.app_name = Some(app_name.clone());
        }

        if let Some(min_pool) = self.min_pool_size {
            options.min_pool_size = Some(min_pool);
        }

        if let Some(max_pool) = self.max_pool_size {
            options.max_pool_size = Some(max_pool);
        }

        if let Some(max_idle) = self.max_idle_time {
            options.max_idle_time = Some(max_idle);
        }

        if let Some(connect_timeout) = self.connect_timeout {
            options.connect_timeout = Some(connect_timeout);
        }

        if let Some(selection_timeout) = self.server_selection_timeout {
            options.server_selection_timeout = Some(selection_timeout);
        }

        Ok(options)
    }
}

fn option_u64(options: &Map<String, Value>, key: &str) -> MongoResult<Option<u64>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| MongoError::config(format!("option '{}' must be a non-negative integer", key))),
    }
}

fn option_u32(options: &Map<String, Value>, key: &str) -> MongoResult<Option<u32>> {
    option_u64(options, key)?
        .map(|v| u32::try_from(v).map_err(|_| MongoError::config(format!("option '{}' is too large", key))))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn target(url: &str) -> ConnectTarget {
        ConnectTarget::parse(url).unwrap()
    }

    #[test]
    fn test_config_from_target() {
        let config = MongoConfig::from_target(&target("mongodb://user:pw@localhost:27017/app?authSource=admin"), &Map::new())
            .unwrap();
        assert_eq!(config.database, "app");
        assert_eq!(config.uri, "mongodb://user:pw@localhost:27017/?authSource=admin");
        assert_eq!(config.app_name.as_deref(), Some("tenantdb"));
        assert_eq!(config.max_pool_size, Some(10));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_tenant_database() {
        let base = target("mongodb://localhost:27017/app");
        let config = MongoConfig::from_target(&base.for_database("tenant_acme"), &Map::new()).unwrap();
        assert_eq!(config.database, "tenant_acme");
        assert_eq!(config.uri, "mongodb://localhost:27017/");
    }

    #[test]
    fn test_default_database() {
        let config = MongoConfig::from_target(&target("mongodb://localhost:27017"), &Map::new()).unwrap();
        assert_eq!(config.database, DEFAULT_DATABASE);
    }

    #[test]
    fn test_options() {
        let mut options = Map::new();
        options.insert("app_name".into(), json!("billing"));
        options.insert("max_pool_size".into(), json!(50));
        options.insert("server_selection_timeout_secs".into(), json!(2));
        let config = MongoConfig::from_target(&target("mongodb://localhost/app"), &options).unwrap();
        assert_eq!(config.app_name.as_deref(), Some("billing"));
        assert_eq!(config.max_pool_size, Some(50));
        assert_eq!(config.server_selection_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_invalid_config() {
        assert!(MongoConfig::from_target(&target("postgres://localhost/app"), &Map::new()).is_err());

        let mut options = Map::new();
        options.insert("max_pool_size".into(), json!("many"));
        assert!(MongoConfig::from_target(&target("mongodb://localhost/app"), &options).is_err());

        let mut options = Map::new();
        options.insert("app_name".into(), json!(7));
        assert!(MongoConfig::from_target(&target("mongodb://localhost/app"), &options).is_err());
    }

    #[tokio::test]
    async fn test_to_client_options() {
        let config = MongoConfig::from_target(&target("mongodb://localhost:27017/app"), &Map::new()).unwrap();
        let options = config.to_client_options().await.unwrap();
        assert_eq!(options.app_name.as_deref(), Some("tenantdb"));
        assert_eq!(options.max_pool_size, Some(10));
    }
}
