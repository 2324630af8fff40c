use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::bbpool;
use crate::config::{BackendKind, Config};
use crate::error::{Result, SharaqError};
use crate::transform::Transformer;
use crate::urlcache::{make_cache_key, UrlCache};

use super::{
    fan_out_delete, fan_out_store, hashed_path, Resolved, REVALIDATE_PROBABILITY, WRITE_CACHE_TTL,
};

/// Derivatives stored on the local filesystem under a fan-out directory
/// tree, served straight from disk.
pub struct FsBackend {
    root: PathBuf,
    image_ttl: Duration,
    cache: Arc<UrlCache>,
    presets: HashMap<String, String>,
    transformer: Arc<Transformer>,
}

impl FsBackend {
    pub fn new(
        config: &Config,
        cache: Arc<UrlCache>,
        transformer: Arc<Transformer>,
    ) -> Result<Self> {
        if config.backend.root.is_empty() {
            return Err(SharaqError::Config("fs backend: 'Root' is required".into()));
        }
        let root = PathBuf::from(&config.backend.root);
        info!("fs backend: storing files under {}", root.display());

        Ok(Self {
            root,
            image_ttl: Duration::from_secs(config.backend.image_ttl),
            cache,
            presets: config.presets.clone(),
            transformer,
        })
    }

    pub fn encode_filename(&self, preset: &str, origin: &str) -> PathBuf {
        self.root.join(hashed_path(preset, origin))
    }

    pub async fn get(&self, origin: &url::Url, preset: &str) -> Result<Resolved> {
        let tag = BackendKind::Fs.tag();
        let cache_key = make_cache_key(&[tag, preset, origin.as_str()]);

        let cached = self.cache.lookup(&cache_key).await;
        if !cached.is_empty() {
            let path = PathBuf::from(&cached);
            let revalidate = rand::thread_rng().gen_bool(REVALIDATE_PROBABILITY);
            if revalidate && tokio::fs::metadata(&path).await.is_err() {
                warn!("evicting stale cache entry {} -> {}", cache_key, cached);
                let _ = self.cache.delete(&cache_key).await;
            } else {
                debug!("cached entry found for {}:{} -> {}", preset, origin, cached);
                return Ok(Resolved::File(path));
            }
        }

        let path = self.encode_filename(preset, origin.as_str());
        if tokio::fs::metadata(&path).await.is_ok() {
            // the write path owns cache population
            return Ok(Resolved::File(path));
        }

        Err(SharaqError::TransformationRequired)
    }

    pub async fn store_transformed_content(&self, origin: &url::Url) -> Result<()> {
        info!("transforming image at url {}", origin);

        let result = fan_out_store(&self.presets, |preset, rule| {
            let transformer = self.transformer.clone();
            let cache = self.cache.clone();
            let origin = origin.clone();
            let path = self.encode_filename(&preset, origin.as_str());
            let cache_key = make_cache_key(&[BackendKind::Fs.tag(), &preset, origin.as_str()]);

            async move {
                let mut buf = bbpool::get();
                let res = async {
                    debug!("applying transformation {} ({})", preset, rule);
                    transformer.transform(&rule, origin.as_str(), &mut buf).await?;

                    debug!("saving to {}", path.display());
                    create_parent_dirs(&path).await?;
                    tokio::fs::write(&path, &buf).await.map_err(|e| {
                        SharaqError::Storage(format!(
                            "failed to write {}: {}",
                            path.display(),
                            e
                        ))
                    })?;

                    cache
                        .set(&cache_key, &path.to_string_lossy(), Some(WRITE_CACHE_TTL))
                        .await?;
                    Ok(())
                }
                .await;
                bbpool::release(buf);
                res
            }
        })
        .await;

        // clean up expired derivatives off the request path
        if !self.image_ttl.is_zero() {
            tokio::spawn(sweep_storage_root(self.root.clone(), self.image_ttl));
        }

        result
    }

    pub async fn delete(&self, origin: &url::Url) -> Result<()> {
        fan_out_delete(&self.presets, |preset| {
            let cache = self.cache.clone();
            let origin = origin.clone();
            let path = self.encode_filename(&preset, origin.as_str());
            let cache_key = make_cache_key(&[BackendKind::Fs.tag(), &preset, origin.as_str()]);

            async move {
                debug!("deleting filesystem entry {}", path.display());
                let res = tokio::fs::remove_file(&path).await.map_err(|e| {
                    SharaqError::Storage(format!("failed to remove {}: {}", path.display(), e))
                });

                // losing the cache is cheaper than a dangling pointer
                if let Err(e) = cache.delete(&cache_key).await {
                    warn!("failed to invalidate cache entry {}: {}", cache_key, e);
                }

                res
            }
        })
        .await
    }
}

async fn create_parent_dirs(path: &Path) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if tokio::fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SharaqError::Storage(format!("failed to create {}: {}", dir.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o744)).await;
    }

    Ok(())
}

/// Walk the storage root and remove derivatives whose mtime is older
/// than the TTL.
async fn sweep_storage_root(root: PathBuf, ttl: Duration) {
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
                continue;
            }
            let expired = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > ttl)
                .unwrap_or(false);
            if expired {
                debug!("sweeping expired derivative {}", path.display());
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }
}
