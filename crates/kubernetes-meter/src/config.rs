//! Configuration management
//!
//! All settings come from the environment, optionally seeded from an
//! env-style file given on the command line.

use gratia_common::forwarder::CollectorSettings;
use gratia_common::{GratiaError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Meter Configuration Constants
// ============================================================================

/// Default number of queue entries processed per forwarding session.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of records per collector bundle.
pub const DEFAULT_BUNDLE_SIZE: usize = 100;

/// Default directory for records awaiting collector acknowledgement.
pub const DEFAULT_OUTBOX_DIR: &str = "/var/lib/gratia/outbox";

/// Default collector request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Reporter name announced to the collector.
pub const REPORTER_NAME: &str = "kubernetes_meter";

/// Service name announced to the collector.
pub const SERVICE_NAME: &str = "Kubernetes";

/// Kubernetes meter configuration
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Directory queue holding APEL records
    pub queue_dir: PathBuf,
    /// Collector endpoint URL
    pub collector_url: String,
    pub outbox_dir: PathBuf,
    /// user-vo-map file; `None` disables VO mapping
    pub user_vo_map: Option<PathBuf>,
    pub batch_size: usize,
    pub bundle_size: usize,
    /// Age after which another consumer's claim is considered abandoned.
    /// `None` never breaks claims.
    pub lease_timeout_secs: Option<u64>,
    /// Resolve `ReportableVOName` through the user-vo-map instead of copying `VO`
    pub resolve_reportable_vo: bool,
    pub probe_version: String,
    pub http_timeout_secs: u64,
}

impl MeterConfig {
    /// Load configuration, reading `env_file` first when given
    ///
    /// Variables already present in the environment take precedence over
    /// the file. Without a file, `.env` in the working directory is used
    /// if it exists.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| {
                    GratiaError::config(format!("cannot load env file {}: {}", path.display(), e))
                })?;
            },
            None => {
                dotenvy::dotenv().ok();
            },
        }

        Self::from_env()
    }

    /// Read configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = MeterConfig {
            queue_dir: var("GRATIA_QUEUE_DIR")
                .map(PathBuf::from)
                .ok_or_else(|| GratiaError::config("GRATIA_QUEUE_DIR is not set"))?,
            collector_url: var("GRATIA_COLLECTOR_URL")
                .ok_or_else(|| GratiaError::config("GRATIA_COLLECTOR_URL is not set"))?,
            outbox_dir: var("GRATIA_OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTBOX_DIR)),
            user_vo_map: var("GRATIA_USER_VO_MAP")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            batch_size: var("GRATIA_BATCH_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            bundle_size: var("GRATIA_BUNDLE_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BUNDLE_SIZE),
            lease_timeout_secs: var("GRATIA_LEASE_TIMEOUT_SECS").and_then(|s| s.parse().ok()),
            resolve_reportable_vo: var("GRATIA_RESOLVE_REPORTABLE_VO")
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            probe_version: var("GRATIA_PROBE_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            http_timeout_secs: var("GRATIA_HTTP_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue_dir.as_os_str().is_empty() {
            return Err(GratiaError::config("queue directory cannot be empty"));
        }

        if !(self.collector_url.starts_with("http://") || self.collector_url.starts_with("https://")) {
            return Err(GratiaError::config(format!(
                "collector URL must be http(s): '{}'",
                self.collector_url
            )));
        }

        if self.batch_size == 0 {
            return Err(GratiaError::config("batch size must be greater than 0"));
        }

        if self.bundle_size == 0 {
            return Err(GratiaError::config("bundle size must be greater than 0"));
        }

        Ok(())
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout_secs.map(Duration::from_secs)
    }

    /// Settings for the HTTP collector forwarder
    pub fn collector_settings(&self) -> CollectorSettings {
        CollectorSettings {
            collector_url: self.collector_url.clone(),
            outbox_dir: self.outbox_dir.clone(),
            bundle_size: self.bundle_size,
            reporter: REPORTER_NAME.to_string(),
            service: SERVICE_NAME.to_string(),
            probe_version: self.probe_version.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}
