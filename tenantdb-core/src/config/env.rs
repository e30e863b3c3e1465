//! Environment access and the validated-config loader.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::{DatabaseConfig, URL_ENV};
use crate::error::{TenantError, TenantResult, redact};

/// Source for environment variables.
pub trait EnvSource: Send + Sync {
    /// Get an environment variable value.
    fn get(&self, name: &str) -> Option<String>;

    /// Check if a variable exists.
    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// Default environment source using std::env.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Environment source backed by a HashMap.
#[derive(Debug, Clone, Default)]
pub struct MapEnvSource {
    vars: HashMap<String, String>,
}

impl MapEnvSource {
    /// Create a new map-based environment source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for MapEnvSource {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Loads and validates configuration from the environment once.
///
/// The validated config is held until [`clear`](ConfigLoader::clear) is
/// called, so repeated [`init`](ConfigLoader::init) calls are cheap and tests
/// can reset the loader between cases.
///
/// ```rust
/// use tenantdb_core::config::{ConfigLoader, MapEnvSource};
///
/// let loader = ConfigLoader::with_source(
///     MapEnvSource::new().set("DATABASE_URL", "postgres://localhost/app"),
/// );
/// let config = loader.init().unwrap();
/// assert_eq!(config.url, "postgres://localhost/app");
/// assert!(loader.get().is_some());
///
/// loader.clear();
/// assert!(loader.get().is_none());
/// ```
pub struct ConfigLoader<S: EnvSource = StdEnvSource> {
    source: S,
    validated: Mutex<Option<Arc<DatabaseConfig>>>,
}

impl ConfigLoader<StdEnvSource> {
    /// Create a loader over the process environment.
    pub fn new() -> Self {
        Self::with_source(StdEnvSource)
    }
}

impl Default for ConfigLoader<StdEnvSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: EnvSource> ConfigLoader<S> {
    /// Create a loader over a custom environment source.
    pub fn with_source(source: S) -> Self {
        Self {
            source,
            validated: Mutex::new(None),
        }
    }

    /// Read `DATABASE_URL`, validate the resulting config and keep it.
    ///
    /// Returns the kept config when one is already held.
    pub fn init(&self) -> TenantResult<Arc<DatabaseConfig>> {
        let mut validated = self.validated.lock();
        if let Some(config) = validated.as_ref() {
            return Ok(Arc::clone(config));
        }

        let url = self
            .source
            .get(URL_ENV)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                TenantError::missing_url().with_help(format!("{} is not set", URL_ENV))
            })?;

        let config = DatabaseConfig::new(url);
        let resolved = config.resolve(&self.source)?;
        info!(
            url = %redact(&config.url),
            strategy = %resolved.strategy,
            adapter = %resolved.adapter,
            "Loaded database configuration from environment"
        );

        let config = Arc::new(config);
        *validated = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Get the kept config without loading.
    pub fn get(&self) -> Option<Arc<DatabaseConfig>> {
        self.validated.lock().clone()
    }

    /// Drop the kept config so the next `init` reloads it.
    pub fn clear(&self) {
        self.validated.lock().take();
    }
}
