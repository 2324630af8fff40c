use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crc::{Crc, CRC_64_GO_ISO};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};
use url::Url;

use crate::config::{BackendKind, Config};
use crate::error::{Result, SharaqError};
use crate::transform::Transformer;
use crate::urlcache::UrlCache;

mod fs;
mod object;

use self::fs::FsBackend;
use self::object::ObjectBackend;

/// Cache TTL in seconds for entries written by the store path. Longer
/// than the read-side default so freshly built derivatives stay hot.
pub(crate) const WRITE_CACHE_TTL: u32 = 600;

/// Fraction of cache hits that are re-probed against the backend. A hit
/// whose object has expired gets its cache entry evicted.
pub(crate) const REVALIDATE_PROBABILITY: f64 = 0.25;

pub(crate) const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// How a resolved derivative should be served to the client.
pub enum Resolved {
    /// Permanent redirect to the derivative URL.
    Redirect(String),
    /// Serve the derivative straight from local disk.
    File(PathBuf),
}

pub enum StorageBackend {
    Object(ObjectBackend),
    Fs(FsBackend),
}

impl StorageBackend {
    pub fn new(
        config: &Config,
        cache: Arc<UrlCache>,
        transformer: Arc<Transformer>,
    ) -> Result<Self> {
        info!("using backend type {}", config.backend.kind.tag());
        match config.backend.kind {
            BackendKind::Aws | BackendKind::Gcp => Ok(StorageBackend::Object(
                ObjectBackend::new(config, cache, transformer)?,
            )),
            BackendKind::Fs => Ok(StorageBackend::Fs(FsBackend::new(
                config,
                cache,
                transformer,
            )?)),
        }
    }

    /// Resolve a derivative for (origin, preset): URL cache first, then
    /// a backend existence probe. A miss on both is reported as
    /// `TransformationRequired` for the dispatcher to act on.
    pub async fn get(&self, origin: &Url, preset: &str) -> Result<Resolved> {
        match self {
            StorageBackend::Object(b) => b.get(origin, preset).await,
            StorageBackend::Fs(b) => b.get(origin, preset).await,
        }
    }

    /// Build and store derivatives for every configured preset.
    pub async fn store_transformed_content(&self, origin: &Url) -> Result<()> {
        match self {
            StorageBackend::Object(b) => b.store_transformed_content(origin).await,
            StorageBackend::Fs(b) => b.store_transformed_content(origin).await,
        }
    }

    /// Remove the derivatives for every configured preset, best effort.
    pub async fn delete(&self, origin: &Url) -> Result<()> {
        match self {
            StorageBackend::Object(b) => b.delete(origin).await,
            StorageBackend::Fs(b) => b.delete(origin).await,
        }
    }
}

/// Object path for a derivative: `[prefix/]<preset>/<host>/<sha256hex>`.
/// The digest is over the full origin URL, which keeps paths stable
/// across hosts and defeats adversarial bucketing.
pub(crate) fn object_path(prefix: Option<&str>, preset: &str, origin: &Url) -> String {
    let digest = hex::encode(Sha256::digest(origin.as_str().as_bytes()));
    let host = origin.host_str().unwrap_or_default();
    match prefix {
        Some(p) if !p.is_empty() => {
            format!("{}/{}/{}/{}", p.trim_matches('/'), preset, host, digest)
        }
        _ => format!("{}/{}/{}", preset, host, digest),
    }
}

/// Relative filesystem path for a derivative. The CRC-64 of
/// (preset, origin URL) is interposed as four fan-out directories so no
/// directory accumulates an unbounded number of entries:
/// `a/ab/abc/abcd/abcdef0123456789`.
pub(crate) fn hashed_path(preset: &str, origin: &str) -> PathBuf {
    let mut digest = CRC64.digest();
    digest.update(preset.as_bytes());
    digest.update(origin.as_bytes());
    let v = format!("{:016x}", digest.finalize());

    PathBuf::from(&v[0..1])
        .join(&v[0..2])
        .join(&v[0..3])
        .join(&v[0..4])
        .join(&v)
}

/// Concurrent transforms per fan-out. Decoding and resampling are CPU
/// heavy; an unbounded group would let one store request saturate the
/// host.
const MAX_CONCURRENT_TRANSFORMS: usize = 4;

/// Run one store task per preset concurrently, at most
/// `MAX_CONCURRENT_TRANSFORMS` at a time. The first failure aborts the
/// rest of the group and is surfaced; errors from aborted siblings are
/// suppressed. A panicking task is recovered into a storage error.
pub(crate) async fn fan_out_store<F, Fut>(presets: &HashMap<String, String>, build: F) -> Result<()>
where
    F: Fn(String, String) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_TRANSFORMS));
    let mut tasks = JoinSet::new();
    for (preset, rule) in presets {
        let semaphore = semaphore.clone();
        let task = build(preset.clone(), rule.clone());
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SharaqError::Storage("task group closed".into()))?;
            task.await
        });
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                    tasks.abort_all();
                }
            }
            Err(e) if e.is_panic() => {
                error!("transform worker panicked: {}", e);
                if first_err.is_none() {
                    first_err = Some(SharaqError::Storage("transform worker panicked".into()));
                    tasks.abort_all();
                }
            }
            Err(_) => {} // aborted sibling
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run one delete task per preset. Unlike the store fan-out every task
/// runs to completion; the first error is reported once all are done.
pub(crate) async fn fan_out_delete<F, Fut>(presets: &HashMap<String, String>, del: F) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for preset in presets.keys() {
        tasks.spawn(del(preset.clone()));
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                error!("delete worker failed: {}", e);
                if first_err.is_none() {
                    first_err = Some(SharaqError::Storage("delete worker panicked".into()));
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn presets(n: usize) -> HashMap<String, String> {
        (0..n)
            .map(|i| (format!("p{}", i), "100x100".to_string()))
            .collect()
    }

    #[test]
    fn object_paths_are_stable() {
        let origin = Url::parse("https://example.com/photos/cat.png").unwrap();
        let a = object_path(None, "small", &origin);
        let b = object_path(None, "small", &origin);
        assert_eq!(a, b);

        let parts: Vec<&str> = a.split('/').collect();
        assert_eq!(parts[0], "small");
        assert_eq!(parts[1], "example.com");
        assert_eq!(parts[2].len(), 64); // sha256 hex

        let prefixed = object_path(Some("imgs"), "small", &origin);
        assert_eq!(prefixed, format!("imgs/{}", a));
    }

    #[test]
    fn object_path_differs_per_preset_and_url() {
        let origin = Url::parse("https://example.com/a.png").unwrap();
        let other = Url::parse("https://example.com/b.png").unwrap();
        assert_ne!(
            object_path(None, "small", &origin),
            object_path(None, "large", &origin)
        );
        assert_ne!(
            object_path(None, "small", &origin),
            object_path(None, "small", &other)
        );
    }

    #[test]
    fn hashed_path_interposes_fanout_dirs() {
        let p = hashed_path("small", "https://example.com/a.png");
        let parts: Vec<String> = p
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[4].len(), 16);
        assert_eq!(parts[0], &parts[4][0..1]);
        assert_eq!(parts[1], &parts[4][0..2]);
        assert_eq!(parts[2], &parts[4][0..3]);
        assert_eq!(parts[3], &parts[4][0..4]);

        assert_eq!(p, hashed_path("small", "https://example.com/a.png"));
        assert_ne!(p, hashed_path("large", "https://example.com/a.png"));
    }

    #[tokio::test]
    async fn store_fan_out_runs_every_preset() {
        static DONE: AtomicUsize = AtomicUsize::new(0);
        let res = fan_out_store(&presets(4), |_preset, _rule| async {
            DONE.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(res.is_ok());
        assert_eq!(DONE.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn store_fan_out_surfaces_the_first_error() {
        let res = fan_out_store(&presets(3), |preset, _rule| async move {
            if preset == "p1" {
                Err(SharaqError::Upstream("origin returned 404".into()))
            } else {
                // slow sibling that should get cancelled
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await;
        match res {
            Err(SharaqError::Upstream(_)) => {}
            other => panic!("expected upstream error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn delete_fan_out_attempts_every_preset() {
        static ATTEMPTED: AtomicUsize = AtomicUsize::new(0);
        let res = fan_out_delete(&presets(4), |preset| async move {
            ATTEMPTED.fetch_add(1, Ordering::SeqCst);
            if preset == "p0" {
                Err(SharaqError::Storage("remove failed".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(ATTEMPTED.load(Ordering::SeqCst), 4);
    }
}
