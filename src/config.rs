use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:9090";

/// Main configuration structure. Field names follow the persisted JSON
/// form, which predates this implementation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub listen: String,
    pub presets: HashMap<String, String>,
    pub whitelist: Vec<String>,
    pub tokens: Vec<String>,
    pub backend: BackendConfig,
    #[serde(rename = "URLCache")]
    pub url_cache: UrlCacheConfig,
    pub queue: Option<QueueConfig>,
    pub access_log: Option<AccessLogConfig>,
    pub debug: bool,

    #[serde(skip)]
    pub filename: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BackendConfig {
    #[serde(rename = "Type")]
    pub kind: BackendKind,
    /// Bucket name for the object-store backends.
    pub bucket_name: String,
    /// Static credential attached to object-store requests when present.
    pub access_token: Option<String>,
    /// Optional path prefix prepended to every derivative object.
    pub prefix: Option<String>,
    /// Storage root for the fs backend.
    pub root: String,
    /// Seconds a stored derivative may live on disk (fs backend).
    /// Zero disables the sweeper.
    #[serde(rename = "ImageTTL")]
    pub image_ttl: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Aws,
    Gcp,
    #[default]
    Fs,
}

impl BackendKind {
    /// Tag absorbed into cache keys. The same tag is used on read and
    /// write paths.
    pub fn tag(&self) -> &'static str {
        match self {
            BackendKind::Aws => "aws",
            BackendKind::Gcp => "gcp",
            BackendKind::Fs => "fs",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UrlCacheConfig {
    pub backend_type: CacheBackendType,
    pub addr: Vec<String>,
    /// Default TTL in seconds for cache entries.
    pub expires: u32,
    /// TTL in seconds for the per-URL processing lock.
    #[serde(rename = "ProcessLockTTL")]
    pub process_lock_ttl: u64,
}

impl Default for UrlCacheConfig {
    fn default() -> Self {
        Self {
            backend_type: CacheBackendType::Redis,
            addr: Vec::new(),
            expires: 300,
            process_lock_ttl: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum CacheBackendType {
    #[default]
    Redis,
    Memcached,
}

/// When present, deferred transforms are enqueued by POSTing the target
/// url to this endpoint instead of running in a detached task.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueueConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AccessLogConfig {
    pub log_file: String,
    pub link_name: Option<String>,
    /// Seconds between rotations.
    pub rotation_time: u64,
    /// Seconds a rotated file is retained.
    pub max_age: u64,
    /// IANA timezone name used for log timestamps.
    pub location: Option<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
            link_name: None,
            rotation_time: 24 * 3600,
            max_age: 30 * 24 * 3600,
            location: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.filename = Some(path.to_path_buf());

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill in defaults and canonicalize shorthand forms.
    pub fn normalize(&mut self) {
        if self.listen.is_empty() {
            self.listen = DEFAULT_LISTEN.to_string();
        }
        // ":9090" is shorthand for "0.0.0.0:9090"
        if self.listen.starts_with(':') {
            self.listen = format!("0.0.0.0{}", self.listen);
        }

        if self.url_cache.addr.is_empty() {
            self.url_cache.addr = match self.url_cache.backend_type {
                CacheBackendType::Redis => vec!["127.0.0.1:6379".to_string()],
                CacheBackendType::Memcached => vec!["127.0.0.1:11211".to_string()],
            };
        }
        if self.url_cache.expires == 0 {
            self.url_cache.expires = 300;
        }
        if self.url_cache.process_lock_ttl == 0 {
            self.url_cache.process_lock_ttl = 5;
        }

        self.tokens = self
            .tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.presets.is_empty() {
            anyhow::bail!("at least one preset is required");
        }

        match self.backend.kind {
            BackendKind::Fs => {
                if self.backend.root.is_empty() {
                    anyhow::bail!("fs backend requires 'Root'");
                }
            }
            BackendKind::Aws | BackendKind::Gcp => {
                if self.backend.bucket_name.is_empty() {
                    anyhow::bail!(
                        "{} backend requires 'BucketName'",
                        self.backend.kind.tag()
                    );
                }
            }
        }

        for pat in &self.whitelist {
            regex::Regex::new(pat)
                .with_context(|| format!("invalid whitelist pattern: {}", pat))?;
        }

        if let Some(q) = &self.queue {
            url::Url::parse(&q.addr)
                .with_context(|| format!("invalid queue address: {}", q.addr))?;
        }

        Ok(())
    }

    /// Pretty-print the running configuration at info level.
    pub fn dump(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(s) => tracing::info!("running configuration:\n{}", s),
            Err(e) => tracing::warn!("failed to dump config: {}", e),
        }
    }
}
