//! Configuration management for Stitch Server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::upload::{OrderingPolicy, RetentionPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes
    pub body_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

/// Chunk assembly and publishing settings
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Root of the per-key chunk namespaces
    pub chunk_dir: PathBuf,

    /// Flat namespace for merged artifacts
    pub merged_dir: PathBuf,

    /// Prefix prepended to `{key}/{fileName}` for the remote object key
    pub object_prefix: String,

    /// Lifetime of a presigned transfer descriptor
    pub descriptor_ttl_secs: u64,

    /// Timeout for a single publish transfer
    pub publish_timeout_secs: u64,

    /// HEAD the remote object after publishing and compare sizes
    pub verify_publish: bool,

    pub ordering: OrderingPolicy,
    pub retention: RetentionPolicy,

    /// Sweep key namespaces older than this many hours (0 = never)
    pub chunk_max_age_hours: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_dir: PathBuf::from("./tmp/chunks"),
            merged_dir: PathBuf::from("./tmp/merged"),
            object_prefix: "uploads/".to_string(),
            descriptor_ttl_secs: 60 * 60,
            publish_timeout_secs: 300,
            verify_publish: false,
            ordering: OrderingPolicy::Strict,
            retention: RetentionPolicy::Keep,
            chunk_max_age_hours: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            body_limit: 100 * 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            endpoint: "http://minio:9000".to_string(),
            bucket: "my-bucket".to_string(),
            access_key: "admin".to_string(),
            secret_key: "password123".to_string(),
            region: Some("us-east-1".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();

        ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: env_parse("SERVER_PORT", defaults.port),
            body_limit: env_parse("UPLOAD_BODY_LIMIT", defaults.body_limit),
        }
    }
}

impl StorageConfig {
    /// Endpoint, bucket and credentials are required
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(StorageConfig {
            endpoint: required("S3_ENDPOINT")?,
            bucket: required("S3_BUCKET")?,
            access_key: required("S3_ACCESS_KEY")?,
            secret_key: required("S3_SECRET_KEY")?,
            region: env::var("S3_REGION").ok(),
        })
    }
}

impl UploadConfig {
    pub fn from_env() -> Self {
        let defaults = UploadConfig::default();

        UploadConfig {
            chunk_dir: env::var("CHUNK_DIR").map(PathBuf::from).unwrap_or(defaults.chunk_dir),
            merged_dir: env::var("MERGED_DIR").map(PathBuf::from).unwrap_or(defaults.merged_dir),
            object_prefix: env::var("OBJECT_PREFIX").unwrap_or(defaults.object_prefix),
            descriptor_ttl_secs: env_parse("DESCRIPTOR_TTL_SECS", defaults.descriptor_ttl_secs),
            publish_timeout_secs: env_parse("PUBLISH_TIMEOUT_SECS", defaults.publish_timeout_secs),
            verify_publish: env_parse("PUBLISH_VERIFY", defaults.verify_publish),
            ordering: match env::var("ORDERING_POLICY").unwrap_or_default().as_str() {
                "best-effort" | "best_effort" => OrderingPolicy::BestEffort,
                _ => defaults.ordering,
            },
            retention: match env::var("RETENTION_POLICY").unwrap_or_default().as_str() {
                "purge-after-publish" | "purge_after_publish" => RetentionPolicy::PurgeAfterPublish,
                _ => defaults.retention,
            },
            chunk_max_age_hours: env_parse("CHUNK_MAX_AGE_HOURS", defaults.chunk_max_age_hours),
        }
    }
}

impl Config {
    /// Read every section from the environment, failing if storage is incomplete
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Config {
            server: ServerConfig::from_env(),
            storage: StorageConfig::from_env()?,
            upload: UploadConfig::from_env(),
        })
    }

    /// Read every section from the environment.
    ///
    /// Only storage falls back to its defaults when incomplete, so server
    /// and upload settings are always honored.
    pub fn load() -> Self {
        let storage = StorageConfig::from_env().unwrap_or_else(|e| {
            tracing::warn!("Incomplete S3 config in env: {}, using default storage", e);
            StorageConfig::default()
        });

        Config {
            server: ServerConfig::from_env(),
            storage,
            upload: UploadConfig::from_env(),
        }
    }
}

/// Read a required variable, treating an empty value as unset
fn required(name: &str) -> Result<String, env::VarError> {
    match env::var(name)? {
        value if value.is_empty() => Err(env::VarError::NotPresent),
        value => Ok(value),
    }
}

/// Parse an optional variable, falling back to `default` when unset or invalid
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
