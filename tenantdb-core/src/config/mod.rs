//! Configuration for tenant-aware database access.
//!
//! A [`DatabaseConfig`] names the backing store by URL and optionally pins the
//! isolation strategy and adapter family. Anything left unset is detected when
//! the config is resolved:
//!
//! - **Adapter**: from the URL scheme (`postgres`/`postgresql` are relational,
//!   `mongodb`/`mongodb+srv` are document stores, `memory` is the in-process
//!   document store).
//! - **Strategy**: explicit value, then the `tenant_strategy` query parameter
//!   of the URL, then the `TENANTDB_STRATEGY` environment variable, then
//!   row-level isolation.
//!
//! ```rust
//! use tenantdb_core::config::{DatabaseConfig, MapEnvSource, StrategyKind, AdapterKind};
//!
//! let config = DatabaseConfig::new("postgres://localhost/app?tenant_strategy=database");
//! let resolved = config.resolve(&MapEnvSource::new()).unwrap();
//!
//! assert_eq!(resolved.strategy, StrategyKind::Database);
//! assert_eq!(resolved.adapter, AdapterKind::Relational);
//! // The hint is consumed and never reaches the driver.
//! assert_eq!(resolved.url.as_str(), "postgres://localhost/app");
//! ```

mod env;

pub use env::{ConfigLoader, EnvSource, MapEnvSource, StdEnvSource};

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{TenantError, TenantResult, redact};
use crate::tenant::{TenantId, validate_identifier};

/// Environment variable holding the database URL.
pub const URL_ENV: &str = "DATABASE_URL";

/// Environment variable consulted for the strategy when nothing else sets it.
pub const STRATEGY_ENV: &str = "TENANTDB_STRATEGY";

/// URL query parameter carrying a strategy hint.
pub const STRATEGY_QUERY_PARAM: &str = "tenant_strategy";

/// How tenants are isolated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// All tenants share tables; rows carry a tenant column.
    #[default]
    Row,
    /// Each tenant gets its own logical database.
    Database,
}

impl StrategyKind {
    /// Get the strategy name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "row" | "row-level" | "row_level" => Ok(Self::Row),
            "database" | "db" | "database-level" | "database_level" => Ok(Self::Database),
            other => Err(TenantError::configuration(format!(
                "Unknown tenant strategy '{}'",
                other
            ))
            .with_suggestion("Use 'row' or 'database'")),
        }
    }
}

/// The family of client an adapter speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// SQL databases (PostgreSQL).
    Relational,
    /// Document stores (MongoDB, in-memory).
    Document,
}

impl AdapterKind {
    /// Determine the adapter family from a URL scheme.
    pub fn from_scheme(scheme: &str) -> TenantResult<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Relational),
            "mongodb" | "mongodb+srv" | "memory" => Ok(Self::Document),
            other => Err(TenantError::unsupported_scheme(other)),
        }
    }

    /// Get the adapter family name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The concrete product behind a URL. Used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Plain PostgreSQL.
    Postgres,
    /// CockroachDB speaking the PostgreSQL protocol.
    CockroachDb,
    /// Self-hosted MongoDB.
    MongoDb,
    /// MongoDB Atlas (SRV records or `*.mongodb.net` hosts).
    MongoDbAtlas,
    /// The in-process memory store.
    Memory,
    /// Anything else.
    Unknown,
}

impl Provider {
    /// Guess the provider from a connection URL.
    pub fn detect(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        match url.scheme() {
            "postgres" | "postgresql" => {
                if host.contains("cockroach") || url.port() == Some(26257) {
                    Self::CockroachDb
                } else {
                    Self::Postgres
                }
            }
            "mongodb+srv" => Self::MongoDbAtlas,
            "mongodb" if host.ends_with(".mongodb.net") => Self::MongoDbAtlas,
            "mongodb" => Self::MongoDb,
            "memory" => Self::Memory,
            _ => Self::Unknown,
        }
    }

    /// Get the provider name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::CockroachDb => "cockroachdb",
            Self::MongoDb => "mongodb",
            Self::MongoDbAtlas => "mongodb-atlas",
            Self::Memory => "memory",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for row-level tenant isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowLevelConfig {
    /// The column name that stores the tenant ID.
    pub column: String,
    /// Tables carrying the tenant column. Discovered from the store when empty.
    pub tables: Vec<String>,
    /// Tables shared across all tenants (never filtered).
    pub shared_tables: HashSet<String>,
}

impl Default for RowLevelConfig {
    fn default() -> Self {
        Self::new("tenant_id")
    }
}

impl RowLevelConfig {
    /// Create a new row-level config with the given column name.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            tables: Vec::new(),
            shared_tables: HashSet::new(),
        }
    }

    /// Add a tenant-bearing table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Mark a table as shared (no tenant filtering).
    pub fn shared_table(mut self, table: impl Into<String>) -> Self {
        self.shared_tables.insert(table.into());
        self
    }

    fn validate(&self) -> TenantResult<()> {
        validate_sql_name("tenant column", &self.column)?;
        for table in self.tables.iter().chain(self.shared_tables.iter()) {
            validate_sql_name("table name", table)?;
        }
        Ok(())
    }
}

/// Configuration for database-level tenant isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseLevelConfig {
    /// Prefix for tenant database names (e.g., "tenant_" -> "tenant_acme").
    pub prefix: String,
    /// Suffix for tenant database names.
    pub suffix: String,
    /// Create a tenant's database on first connection instead of failing.
    pub auto_create: bool,
}

impl Default for DatabaseLevelConfig {
    fn default() -> Self {
        Self {
            prefix: "tenant_".to_string(),
            suffix: String::new(),
            auto_create: false,
        }
    }
}

/// Databases never reported as tenants, even when the naming has no prefix.
const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1", "admin", "local", "config"];

impl DatabaseLevelConfig {
    /// Set the database name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the database name suffix.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Create tenant databases on first connection.
    pub fn with_auto_create(mut self) -> Self {
        self.auto_create = true;
        self
    }

    /// Get the database name for a tenant.
    ///
    /// Fails when prefix + tenant + suffix exceeds the identifier limit.
    pub fn database_name(&self, tenant: &TenantId) -> TenantResult<String> {
        let name = format!("{}{}{}", self.prefix, tenant, self.suffix);
        validate_identifier("database name", &name).map_err(|e| e.with_tenant(tenant))?;
        Ok(name)
    }

    /// Recover the tenant from a database name, if it follows the naming.
    pub fn tenant_from_database(&self, name: &str) -> Option<TenantId> {
        if SYSTEM_DATABASES.contains(&name) {
            return None;
        }
        let inner = name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        TenantId::new(inner).ok()
    }

    fn validate(&self) -> TenantResult<()> {
        for (what, part) in [("database prefix", &self.prefix), ("database suffix", &self.suffix)] {
            if !part.is_empty() {
                validate_identifier(what, part)?;
            }
        }
        Ok(())
    }
}

/// Bounds on the per-strategy connection cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached tenant connections (`None` = unbounded).
    pub max_entries: Option<usize>,
    /// Maximum lifetime of a cached connection.
    #[serde(with = "duration_secs")]
    pub max_age: Option<Duration>,
    /// Evict connections nobody has used for this long.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Option<Duration>,
    /// Run a background sweep for expired entries at this interval.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(1000),
            max_age: None,
            idle_timeout: Some(Duration::from_secs(600)),
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Create a cache config with no bounds at all.
    pub fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_age: None,
            idle_timeout: None,
            sweep_interval: None,
        }
    }

    /// Set the maximum number of entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set the maximum connection age.
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the background sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    fn validate(&self) -> TenantResult<()> {
        if self.max_entries == Some(0) {
            return Err(TenantError::configuration("cache.max_entries must be at least 1")
                .with_suggestion("Omit max_entries for an unbounded cache"));
        }
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(TenantError::configuration("cache.sweep_interval must be positive"));
        }
        Ok(())
    }
}

/// Database configuration.
///
/// Built once and never mutated after the facade is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    #[serde(default)]
    pub url: String,
    /// Isolation strategy; detected when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    /// Adapter family; detected from the URL scheme when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterKind>,
    /// Options passed through to the adapter.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Row-level isolation settings.
    #[serde(default)]
    pub row: RowLevelConfig,
    /// Database-level isolation settings.
    #[serde(default)]
    pub database: DatabaseLevelConfig,
    /// Connection cache bounds.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl DatabaseConfig {
    /// Create a config for the given URL with everything else defaulted.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            strategy: None,
            adapter: None,
            options: serde_json::Map::new(),
            row: RowLevelConfig::default(),
            database: DatabaseLevelConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Load the config from `DATABASE_URL`.
    pub fn from_env() -> TenantResult<Self> {
        ConfigLoader::new().init().map(|config| config.as_ref().clone())
    }

    /// Pin the isolation strategy.
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Pin the adapter family.
    pub fn with_adapter(mut self, adapter: AdapterKind) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Add an adapter pass-through option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set the row-level settings.
    pub fn with_row_config(mut self, row: RowLevelConfig) -> Self {
        self.row = row;
        self
    }

    /// Set the database-level settings.
    pub fn with_database_config(mut self, database: DatabaseLevelConfig) -> Self {
        self.database = database;
        self
    }

    /// Set the cache bounds.
    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Validate the config and fill in every detected setting.
    ///
    /// Performs no I/O; `env` is only consulted for the strategy fallback.
    pub fn resolve(&self, env: &dyn EnvSource) -> TenantResult<ResolvedConfig> {
        if self.url.trim().is_empty() {
            return Err(TenantError::missing_url());
        }

        let mut url = Url::parse(self.url.trim()).map_err(|e| TenantError::invalid_url(&self.url, e))?;
        let detected = AdapterKind::from_scheme(url.scheme())?;
        let adapter = match self.adapter {
            Some(explicit) if explicit != detected => {
                return Err(TenantError::configuration(format!(
                    "The {} adapter cannot serve '{}' URLs",
                    explicit,
                    url.scheme()
                )));
            }
            Some(explicit) => explicit,
            None => detected,
        };

        let hint = take_query_param(&mut url, STRATEGY_QUERY_PARAM);
        let (strategy, source) = match (self.strategy, hint, env.get(STRATEGY_ENV)) {
            (Some(explicit), _, _) => (explicit, DetectionSource::Explicit),
            (None, Some(hint), _) => (hint.parse()?, DetectionSource::UrlHint),
            (None, None, Some(var)) if !var.trim().is_empty() => {
                (var.parse()?, DetectionSource::Environment)
            }
            _ => (StrategyKind::default(), DetectionSource::Default),
        };

        self.row.validate()?;
        self.database.validate()?;
        self.cache.validate()?;

        let provider = Provider::detect(&url);
        debug!(
            url = %redact(url.as_str()),
            strategy = %strategy,
            strategy_source = ?source,
            adapter = %adapter,
            provider = %provider,
            "Resolved database configuration"
        );

        Ok(ResolvedConfig {
            config: self.clone(),
            url,
            strategy,
            strategy_source: source,
            adapter,
            provider,
        })
    }
}

/// Where a detected setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    /// Set on the config.
    Explicit,
    /// The `tenant_strategy` URL query parameter.
    UrlHint,
    /// The `TENANTDB_STRATEGY` environment variable.
    Environment,
    /// Nothing set it.
    Default,
}

/// A validated config with every detected setting filled in.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The config as given.
    pub config: DatabaseConfig,
    /// The parsed URL, without the strategy hint.
    pub url: Url,
    /// The isolation strategy.
    pub strategy: StrategyKind,
    /// Where the strategy came from.
    pub strategy_source: DetectionSource,
    /// The adapter family.
    pub adapter: AdapterKind,
    /// The detected provider.
    pub provider: Provider,
}

impl ResolvedConfig {
    /// The URL with any password masked.
    pub fn redacted_url(&self) -> String {
        redact(self.url.as_str())
    }
}

/// Table and column names may be schema-qualified (`public.users`).
fn validate_sql_name(what: &str, value: &str) -> TenantResult<()> {
    value
        .split('.')
        .try_for_each(|part| validate_identifier(what, part))
}

/// Remove `name` from the query string, returning its last value.
fn take_query_param(url: &mut Url, name: &str) -> Option<String> {
    if !url.query_pairs().any(|(key, _)| key == name) {
        return None;
    }
    let mut value = None;
    let rest: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, val)| {
            if key == name {
                value = Some(val.into_owned());
                None
            } else {
                Some((key.into_owned(), val.into_owned()))
            }
        })
        .collect();

    if rest.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(rest);
    }
    value
}

mod duration_secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(secs) => Err(D::Error::custom(format!(
                "expected a non-negative number of seconds, got {}",
                secs
            ))),
            None => Ok(None),
        }
    }
}
