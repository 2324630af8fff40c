use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::bbpool;
use crate::config::{BackendKind, Config};
use crate::error::{Result, SharaqError};
use crate::transform::Transformer;
use crate::urlcache::{make_cache_key, UrlCache};

use super::{
    fan_out_delete, fan_out_store, object_path, Resolved, REVALIDATE_PROBABILITY, WRITE_CACHE_TTL,
};

/// Derivatives stored in a remote object store (S3 or Google Cloud
/// Storage), addressed by public HTTPS URLs and written with a
/// public-read ACL.
pub struct ObjectBackend {
    kind: BackendKind,
    bucket_name: String,
    prefix: Option<String>,
    access_token: Option<String>,
    cache: Arc<UrlCache>,
    presets: HashMap<String, String>,
    transformer: Arc<Transformer>,
    client: reqwest::Client,
}

impl ObjectBackend {
    pub fn new(
        config: &Config,
        cache: Arc<UrlCache>,
        transformer: Arc<Transformer>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("sharaq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SharaqError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            kind: config.backend.kind,
            bucket_name: config.backend.bucket_name.clone(),
            prefix: config.backend.prefix.clone(),
            access_token: config.backend.access_token.clone(),
            cache,
            presets: config.presets.clone(),
            transformer,
            client,
        })
    }

    fn derivative_url(&self, preset: &str, origin: &url::Url) -> String {
        let path = object_path(self.prefix.as_deref(), preset, origin);
        match self.kind {
            BackendKind::Aws => format!("https://{}.s3.amazonaws.com/{}", self.bucket_name, path),
            _ => format!("https://storage.googleapis.com/{}/{}", self.bucket_name, path),
        }
    }

    async fn head_ok(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("HEAD request to {} failed: {}", url, e);
                false
            }
        }
    }

    pub async fn get(&self, origin: &url::Url, preset: &str) -> Result<Resolved> {
        let cache_key = make_cache_key(&[self.kind.tag(), preset, origin.as_str()]);

        let cached = self.cache.lookup(&cache_key).await;
        if !cached.is_empty() {
            // a fraction of hits is re-probed so the cache cannot point
            // at an expired object past its TTL
            let revalidate = rand::thread_rng().gen_bool(REVALIDATE_PROBABILITY);
            if revalidate && !self.head_ok(&cached).await {
                warn!("evicting stale cache entry {} -> {}", cache_key, cached);
                let _ = self.cache.delete(&cache_key).await;
            } else {
                debug!("cached entry found for {}:{} -> {}", preset, origin, cached);
                return Ok(Resolved::Redirect(cached));
            }
        }

        let specific = self.derivative_url(preset, origin);
        debug!("making HEAD request to {}", specific);
        if self.head_ok(&specific).await {
            // the write path owns cache population
            return Ok(Resolved::Redirect(specific));
        }

        Err(SharaqError::TransformationRequired)
    }

    pub async fn store_transformed_content(&self, origin: &url::Url) -> Result<()> {
        info!("transforming image at url {}", origin);

        fan_out_store(&self.presets, |preset, rule| {
            let transformer = self.transformer.clone();
            let cache = self.cache.clone();
            let client = self.client.clone();
            let access_token = self.access_token.clone();
            let kind = self.kind;
            let origin = origin.clone();
            let dest = self.derivative_url(&preset, &origin);
            let cache_key = make_cache_key(&[kind.tag(), &preset, origin.as_str()]);

            async move {
                let mut buf = bbpool::get();
                let res = async {
                    let out = transformer.transform(&rule, origin.as_str(), &mut buf).await?;

                    debug!("uploading {} bytes to {}", out.size, dest);
                    let acl = match kind {
                        BackendKind::Aws => "x-amz-acl",
                        _ => "x-goog-acl",
                    };
                    let mut req = client
                        .put(&dest)
                        .header(CONTENT_TYPE, out.content_type)
                        .header(acl, "public-read")
                        .body(bytes::Bytes::copy_from_slice(&buf));
                    if let Some(token) = &access_token {
                        req = req.bearer_auth(token);
                    }

                    let resp = req.send().await.map_err(|e| {
                        SharaqError::Storage(format!("failed to upload to {}: {}", dest, e))
                    })?;
                    if !resp.status().is_success() {
                        return Err(SharaqError::Storage(format!(
                            "upload to {} returned {}",
                            dest,
                            resp.status()
                        )));
                    }

                    cache.set(&cache_key, &dest, Some(WRITE_CACHE_TTL)).await?;
                    Ok(())
                }
                .await;
                bbpool::release(buf);
                res
            }
        })
        .await
    }

    pub async fn delete(&self, origin: &url::Url) -> Result<()> {
        fan_out_delete(&self.presets, |preset| {
            let cache = self.cache.clone();
            let client = self.client.clone();
            let access_token = self.access_token.clone();
            let kind = self.kind;
            let origin = origin.clone();
            let dest = self.derivative_url(&preset, &origin);
            let cache_key = make_cache_key(&[kind.tag(), &preset, origin.as_str()]);

            async move {
                debug!("deleting object {}", dest);
                let mut req = client.delete(&dest);
                if let Some(token) = &access_token {
                    req = req.bearer_auth(token);
                }
                let res = match req.send().await {
                    Ok(resp)
                        if resp.status().is_success()
                            || resp.status() == StatusCode::NOT_FOUND =>
                    {
                        Ok(())
                    }
                    Ok(resp) => Err(SharaqError::Storage(format!(
                        "delete of {} returned {}",
                        dest,
                        resp.status()
                    ))),
                    Err(e) => Err(SharaqError::Storage(format!(
                        "failed to delete {}: {}",
                        dest, e
                    ))),
                };

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
