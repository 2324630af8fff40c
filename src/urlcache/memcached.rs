use std::sync::Arc;

use memcache::{CommandError, MemcacheError};
use tracing::debug;

use crate::error::{Result, SharaqError};

/// Memcached variant of the cache backend. Key routing across servers
/// is whatever the client library guarantees; the blocking client is
/// driven from the blocking thread pool.
pub(super) struct Memcached {
    client: Arc<memcache::Client>,
}

impl Memcached {
    pub(super) fn new(servers: &[String]) -> Result<Self> {
        if servers.is_empty() {
            return Err(SharaqError::Config("urlcache: no memcached servers".into()));
        }

        let urls: Vec<String> = servers
            .iter()
            .map(|s| format!("memcache://{}", s))
            .collect();
        let client = memcache::Client::connect(urls)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub(super) async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let client = self.client.clone();
        let key = key.to_string();
        run_blocking(move || client.get::<Vec<u8>>(&key)).await
    }

    pub(super) async fn set(&self, key: &str, value: Vec<u8>, expires: u32) -> Result<()> {
        let client = self.client.clone();
        let key = key.to_string();
        run_blocking(move || client.set(&key, value.as_slice(), expires)).await
    }

    pub(super) async fn set_nx(&self, key: &str, value: Vec<u8>, expires: u32) -> Result<()> {
        let client = self.client.clone();
        let key = key.to_string();
        let res = tokio::task::spawn_blocking(move || client.add(&key, value.as_slice(), expires))
            .await
            .map_err(|e| SharaqError::Cache(format!("memcached worker failed: {}", e)))?;
        match res {
            Ok(()) => Ok(()),
            Err(MemcacheError::CommandError(CommandError::KeyExists)) => {
                debug!("memcached add refused, key already present");
                Err(SharaqError::Contention)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(super) async fn delete(&self, key: &str) -> Result<()> {
        let client = self.client.clone();
        let key = key.to_string();
        // delete reports whether the key existed; deletion is idempotent
        let _ = run_blocking(move || client.delete(&key)).await?;
        Ok(())
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, MemcacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SharaqError::Cache(format!("memcached worker failed: {}", e)))?
        .map_err(Into::into)
}
