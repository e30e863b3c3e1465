//! Logging setup.
//!
//! tenantdb logs through `tracing`. Applications with their own subscriber
//! need nothing from this module. Otherwise, with the `tracing-subscriber`
//! feature enabled, [`init`] installs one driven by the environment:
//!
//! - `TENANTDB_DEBUG=true|1|yes` enables debug logging
//! - `TENANTDB_LOG_LEVEL=trace|debug|info|warn|error` sets the level
//! - `TENANTDB_LOG_FORMAT=json|pretty|compact` sets the output format
//!   (default: json)
//!
//! Within tenantdb, fields are structured:
//!
//! ```rust,ignore
//! debug!(tenant = %tenant, "Connection cache miss");
//! info!(tenant = %tenant, database = %name, "Created tenant database");
//! warn!(error = %err, "Failed to close tenant client");
//! ```

use std::sync::Once;

use crate::config::{EnvSource, StdEnvSource};

/// Enables debug logging.
pub const DEBUG_ENV: &str = "TENANTDB_DEBUG";
/// Overrides the log level.
pub const LOG_LEVEL_ENV: &str = "TENANTDB_LOG_LEVEL";
/// Selects the output format.
pub const LOG_FORMAT_ENV: &str = "TENANTDB_LOG_FORMAT";

static INIT: Once = Once::new();

/// Logging settings read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    /// Whether anything asked for logging.
    pub enabled: bool,
    /// The level filter.
    pub level: &'static str,
    /// The output format.
    pub format: &'static str,
}

impl LogSettings {
    /// Read the settings from `env`.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let debug = env
            .get(DEBUG_ENV)
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"));
        let fallback = if debug { "debug" } else { "warn" };

        let explicit = env.get(LOG_LEVEL_ENV);
        let level = match explicit.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => fallback,
        };

        let format = match env.get(LOG_FORMAT_ENV).map(|f| f.to_ascii_lowercase()).as_deref() {
            Some("pretty") => "pretty",
            Some("compact") => "compact",
            _ => "json",
        };

        Self {
            enabled: debug || explicit.is_some(),
            level,
            format,
        }
    }

    /// The `EnvFilter` directive covering the tenantdb crates.
    pub fn directive(&self) -> String {
        [
            "tenantdb",
            "tenantdb_core",
            "tenantdb_postgres",
            "tenantdb_mongodb",
            "tenantdb_axum",
        ]
        .iter()
        .map(|target| format!("{}={}", target, self.level))
        .collect::<Vec<_>>()
        .join(",")
    }
}

/// Install a subscriber from the process environment.
///
/// Does nothing unless `TENANTDB_DEBUG` or `TENANTDB_LOG_LEVEL` is set.
/// Later calls are no-ops.
pub fn init() {
    let settings = LogSettings::from_env(&StdEnvSource);
    if settings.enabled {
        install(settings);
    }
}

/// Install a subscriber at `level`, ignoring the environment's level.
pub fn init_with_level(level: &str) {
    let mut settings = LogSettings::from_env(&StdEnvSource);
    settings.level = match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "error" => "error",
        _ => "warn",
    };
    install(settings);
}

#[cfg(feature = "tracing-subscriber")]
fn install(settings: LogSettings) {
    INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter = EnvFilter::try_new(settings.directive()).unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match settings.format {
            "compact" => registry.with(fmt::layer().compact()).try_init(),
            "pretty" => registry.with(fmt::layer().pretty()).try_init(),
            _ => registry.with(fmt::layer().json()).try_init(),
        };

        if installed.is_ok() {
            tracing::info!(level = settings.level, format = settings.format, "tenantdb logging initialized");
        }
    });
}

#[cfg(not(feature = "tracing-subscriber"))]
fn install(_settings: LogSettings) {
    // Without the subscriber feature, logs go to whatever subscriber the
    // application installs.
    INIT.call_once(|| {});
}
