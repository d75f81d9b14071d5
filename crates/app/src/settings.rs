use std::path::PathBuf;
use std::time::Duration;

use labstage_core::{CatalogError, CatalogSet, ConfidenceThresholds, RetryPolicy, ThresholdError};
use thiserror::Error;

use crate::batch::BatchLimits;

pub const MAX_WORKER_LIMIT: usize = 1024;
pub const MAX_BATCH_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid confidence thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
    #[error("Failed to read catalog file {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid catalog file {path}: {source}")]
    Catalog {
        path: PathBuf,
        #[source]
        source: CatalogError,
    },
}

/// Process configuration, read once at start from `LABSTAGE_*` variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bucket the local intake directory stands in for.
    pub bucket: String,
    pub database_path: PathBuf,
    pub database_max_connections: u32,
    pub extraction_endpoint: Option<String>,
    pub extraction_region: String,
    pub extraction_timeout: Duration,
    pub thresholds: ConfidenceThresholds,
    pub worker_limit: usize,
    pub batch_timeout: Duration,
    /// Replaces the built-in catalogs when set.
    pub catalog_path: Option<PathBuf>,
    pub object_root: PathBuf,
    pub service_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let thresholds = ConfidenceThresholds::new(
            parse_or(&get, "LABSTAGE_CONFIDENCE_LOW", 50.0)?,
            parse_or(&get, "LABSTAGE_CONFIDENCE_MEDIUM", 70.0)?,
            parse_or(&get, "LABSTAGE_CONFIDENCE_HIGH", 90.0)?,
        )?;

        let service_default = RetryPolicy::service_default();
        let service_retry = RetryPolicy::new(
            parse_or(&get, "LABSTAGE_SERVICE_MAX_ATTEMPTS", service_default.max_attempts)?,
            Duration::from_millis(parse_or(
                &get,
                "LABSTAGE_SERVICE_BASE_DELAY_MS",
                service_default.base_delay.as_millis() as u64,
            )?),
            service_default.max_delay,
            service_default.jitter,
        );
        let store_default = RetryPolicy::store_default();
        let store_retry = RetryPolicy::new(
            parse_or(&get, "LABSTAGE_STORE_MAX_ATTEMPTS", store_default.max_attempts)?,
            Duration::from_millis(parse_or(
                &get,
                "LABSTAGE_STORE_BASE_DELAY_MS",
                store_default.base_delay.as_millis() as u64,
            )?),
            store_default.max_delay,
            store_default.jitter,
        );

        let worker_limit: usize = parse_or(&get, "LABSTAGE_WORKER_LIMIT", 4)?;
        if !(1..=MAX_WORKER_LIMIT).contains(&worker_limit) {
            return Err(ConfigError::Invalid {
                var: "LABSTAGE_WORKER_LIMIT",
                value: worker_limit.to_string(),
                reason: format!("must be between 1 and {MAX_WORKER_LIMIT}"),
            });
        }
        let batch_timeout_secs: u64 = parse_or(&get, "LABSTAGE_BATCH_TIMEOUT_SECS", 300)?;
        if !(1..=MAX_BATCH_TIMEOUT_SECS).contains(&batch_timeout_secs) {
            return Err(ConfigError::Invalid {
                var: "LABSTAGE_BATCH_TIMEOUT_SECS",
                value: batch_timeout_secs.to_string(),
                reason: format!("must be between 1 and {MAX_BATCH_TIMEOUT_SECS}"),
            });
        }

        Ok(Self {
            bucket: get("LABSTAGE_BUCKET").unwrap_or_else(|| "patient-uploads".into()),
            database_path: get("LABSTAGE_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("labstage.db")),
            database_max_connections: parse_or(&get, "LABSTAGE_DATABASE_MAX_CONNECTIONS", 5)?,
            extraction_endpoint: get("LABSTAGE_EXTRACTION_ENDPOINT"),
            extraction_region: get("LABSTAGE_EXTRACTION_REGION").unwrap_or_else(|| "us-east-1".into()),
            extraction_timeout: Duration::from_secs(parse_or(&get, "LABSTAGE_EXTRACTION_TIMEOUT_SECS", 30)?),
            thresholds,
            worker_limit,
            batch_timeout: Duration::from_secs(batch_timeout_secs),
            catalog_path: get("LABSTAGE_CATALOG_PATH").map(PathBuf::from),
            object_root: get("LABSTAGE_OBJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("objects")),
            service_retry,
            store_retry,
        })
    }

    pub fn extraction_endpoint(&self) -> Result<&str, ConfigError> {
        self.extraction_endpoint
            .as_deref()
            .ok_or(ConfigError::Missing("LABSTAGE_EXTRACTION_ENDPOINT"))
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            worker_limit: self.worker_limit,
            time_budget: self.batch_timeout,
        }
    }

    /// The catalog file if one is configured, otherwise the built-in set.
    pub fn load_catalogs(&self) -> Result<CatalogSet, ConfigError> {
        let Some(path) = &self.catalog_path else {
            return Ok(CatalogSet::builtin());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
            path: path.clone(),
            source,
        })?;
        CatalogSet::from_toml(&content).map_err(|source| ConfigError::Catalog {
            path: path.clone(),
            source,
        })
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
