use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use opsdash_store_core::LoadPolicy;
use opsdash_store_s3::S3Config;
use opsdash_store_webdav::WebDavConfig;

use crate::cached::CacheMode;

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// JSON file on the local filesystem
    Local,
    /// File on a WebDAV server
    Webdav,
    /// Object in an S3-compatible bucket
    S3,
}

/// Storage configuration, from flags or environment.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Storage backend
    #[arg(long, value_enum, default_value = "local", env = "DATA_BACKEND")]
    pub backend: BackendKind,

    /// Data file for the local backend
    #[arg(long, default_value = "./data.json", env = "DATA_PATH")]
    pub data_path: PathBuf,

    /// WebDAV server base URL
    #[arg(long, env = "WEBDAV_URL")]
    pub webdav_url: Option<String>,

    /// WebDAV username (basic auth)
    #[arg(long, env = "WEBDAV_USERNAME")]
    pub webdav_username: Option<String>,

    /// WebDAV password (basic auth)
    #[arg(long, env = "WEBDAV_PASSWORD", hide_env_values = true)]
    pub webdav_password: Option<String>,

    /// Path of the data file on the WebDAV server
    #[arg(long, default_value = "/deploy-manage/data.json", env = "WEBDAV_FILE_PATH")]
    pub webdav_file_path: String,

    /// Custom S3 endpoint (R2, OSS, MinIO). AWS when unset.
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long, default_value = "auto", env = "S3_REGION")]
    pub s3_region: String,

    /// S3 bucket name
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// S3 access key ID
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    /// Object key of the data file
    #[arg(long, default_value = "deploy-manage/data.json", env = "S3_OBJECT_KEY")]
    pub s3_object_key: String,

    /// Use path-style bucket addressing
    #[arg(long, env = "S3_FORCE_PATH_STYLE")]
    pub s3_force_path_style: bool,

    /// Put a local cache in front of a remote backend
    #[arg(long, env = "OPSDASH_CACHE")]
    pub cache: bool,

    /// Cache file location (implies --cache)
    #[arg(long, env = "CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Short-lived process: scratch cache with write-through (implies --cache)
    #[arg(long, env = "OPSDASH_EPHEMERAL")]
    pub ephemeral: bool,

    /// Seconds between background cache syncs
    #[arg(long, default_value = "300", env = "SYNC_INTERVAL_SECS")]
    pub sync_interval_secs: u64,

    /// Fail on a corrupt stored document instead of starting from an empty one
    #[arg(long, env = "REJECT_CORRUPT")]
    pub reject_corrupt: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{backend} backend requires {setting}")]
    Missing {
        backend: &'static str,
        setting: &'static str,
    },

    #[error("invalid {setting}: {message}")]
    Invalid {
        setting: &'static str,
        message: String,
    },
}

/// A validated backend selection.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Local { path: PathBuf },
    WebDav(WebDavConfig),
    S3(S3Config),
}

/// Cache settings for a remote backend.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub mode: CacheMode,
    pub sync_interval: Duration,
}

impl Config {
    /// Resolve the flat settings into one backend, checking required values.
    pub fn backend(&self) -> Result<BackendConfig, ConfigError> {
        match self.backend {
            BackendKind::Local => Ok(BackendConfig::Local {
                path: self.data_path.clone(),
            }),
            BackendKind::Webdav => {
                let url = present(&self.webdav_url).ok_or(ConfigError::Missing {
                    backend: "webdav",
                    setting: "WEBDAV_URL",
                })?;
                url::Url::parse(&url).map_err(|e| ConfigError::Invalid {
                    setting: "WEBDAV_URL",
                    message: e.to_string(),
                })?;

                Ok(BackendConfig::WebDav(WebDavConfig {
                    url,
                    username: present(&self.webdav_username),
                    password: present(&self.webdav_password),
                    file_path: self.webdav_file_path.trim().to_string(),
                }))
            }
            BackendKind::S3 => {
                let required = |value: &Option<String>, setting: &'static str| {
                    present(value).ok_or(ConfigError::Missing {
                        backend: "s3",
                        setting,
                    })
                };

                Ok(BackendConfig::S3(S3Config {
                    endpoint: present(&self.s3_endpoint),
                    region: self.s3_region.trim().to_string(),
                    bucket: required(&self.s3_bucket, "S3_BUCKET")?,
                    access_key_id: required(&self.s3_access_key_id, "S3_ACCESS_KEY_ID")?,
                    secret_access_key: required(
                        &self.s3_secret_access_key,
                        "S3_SECRET_ACCESS_KEY",
                    )?,
                    object_key: self.s3_object_key.trim().to_string(),
                    force_path_style: self.s3_force_path_style,
                }))
            }
        }
    }

    /// Cache settings, `None` when the backend is used directly.
    ///
    /// The local backend is never cached.
    pub fn cache(&self) -> Option<CacheConfig> {
        let wanted = self.cache || self.ephemeral || self.cache_path.is_some();
        if !wanted || self.backend == BackendKind::Local {
            return None;
        }

        Some(CacheConfig {
            path: self.cache_path.clone().unwrap_or_else(default_cache_path),
            mode: if self.ephemeral {
                CacheMode::Ephemeral
            } else {
                CacheMode::LongLived
            },
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
        })
    }

    pub fn load_policy(&self) -> LoadPolicy {
        if self.reject_corrupt {
            LoadPolicy::Reject
        } else {
            LoadPolicy::Degrade
        }
    }
}

/// Trimmed value, `None` when unset or blank.
fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Platform cache directory, e.g. `~/.cache/opsdash/data.json` on Linux.
fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("opsdash")
        .join("data.json")
}
