use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{IMAGE_BATCH_SIZE, MAX_IMAGE_BYTES};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Where archive blobs (snapshots, images) are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Files under a local directory.
    Local { root: PathBuf },
    /// An S3-compatible bucket.
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_path: PathBuf,

    // Blob storage
    pub storage: StorageBackend,
    pub public_storage_prefix: String,

    // Workers
    pub worker_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub poll_interval: Duration,

    // Jobs
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub archive_timeout: Duration,

    // Network
    pub page_timeout: Duration,
    pub image_timeout: Duration,
    pub image_concurrency: usize,
    pub max_image_bytes: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Database
            database_path: PathBuf::from(env_or_default(
                "DATABASE_PATH",
                "./data/bookmarks.sqlite",
            )),

            // Blob storage
            storage: parse_storage_backend(&env_or_default("STORAGE_BACKEND", "local"))?,
            public_storage_prefix: env_or_default("PUBLIC_STORAGE_PREFIX", "/storage/"),

            // Workers
            worker_concurrency: parse_env_usize("WORKER_CONCURRENCY", 4)?,
            per_domain_concurrency: parse_env_usize("PER_DOMAIN_CONCURRENCY", 2)?,
            poll_interval: Duration::from_secs(parse_env_u64("POLL_INTERVAL_SECS", 10)?),

            // Jobs
            max_attempts: parse_env_u32("ARCHIVE_MAX_ATTEMPTS", 3)?,
            retry_backoff: Duration::from_secs(parse_env_u64("ARCHIVE_RETRY_BACKOFF_SECS", 60)?),
            archive_timeout: Duration::from_secs(parse_env_u64("ARCHIVE_TIMEOUT_SECS", 120)?),

            // Network
            page_timeout: Duration::from_secs(parse_env_u64("PAGE_TIMEOUT_SECS", 30)?),
            image_timeout: Duration::from_secs(parse_env_u64("IMAGE_TIMEOUT_SECS", 15)?),
            image_concurrency: parse_env_usize("IMAGE_CONCURRENCY", IMAGE_BATCH_SIZE)?,
            max_image_bytes: parse_env_u64("MAX_IMAGE_BYTES", MAX_IMAGE_BYTES)?,
        })
    }

    /// A complete configuration for tests: local storage under `./data/test-storage`,
    /// no backoff, short timeouts.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_path: PathBuf::from(":memory:"),
            storage: StorageBackend::Local {
                root: PathBuf::from("./data/test-storage"),
            },
            public_storage_prefix: "/storage/".to_string(),
            worker_concurrency: 2,
            per_domain_concurrency: 2,
            poll_interval: Duration::from_millis(50),
            max_attempts: 3,
            retry_backoff: Duration::ZERO,
            archive_timeout: Duration::from_secs(30),
            page_timeout: Duration::from_secs(5),
            image_timeout: Duration::from_secs(5),
            image_concurrency: IMAGE_BATCH_SIZE,
            max_image_bytes: MAX_IMAGE_BYTES,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WORKER_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.per_domain_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "PER_DOMAIN_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.image_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "IMAGE_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ARCHIVE_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if let StorageBackend::S3 { bucket, .. } = &self.storage {
            if bucket.is_empty() {
                return Err(ConfigError::InvalidValue {
                    name: "S3_BUCKET".to_string(),
                    message: "cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_storage_backend(value: &str) -> Result<StorageBackend, ConfigError> {
    match value.to_lowercase().as_str() {
        "local" => Ok(StorageBackend::Local {
            root: PathBuf::from(env_or_default("STORAGE_ROOT", "./data/storage")),
        }),
        "s3" => Ok(StorageBackend::S3 {
            bucket: required_env("S3_BUCKET")?,
            region: env_or_default("S3_REGION", "us-east-1"),
            endpoint: optional_env("S3_ENDPOINT"),
        }),
        _ => Err(ConfigError::InvalidValue {
            name: "STORAGE_BACKEND".to_string(),
            message: format!("must be 'local' or 's3', got '{value}'"),
        }),
    }
}
