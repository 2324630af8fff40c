use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use regex::Regex;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use url::Url;

use crate::access_log::AccessLog;
use crate::backend::{Resolved, StorageBackend};
use crate::config::Config;
use crate::error::{Result, SharaqError};
use crate::transform::sniff_content_type;
use crate::urlcache::{make_cache_key, UrlCache};

/// Header carrying the administrative token for store and delete
/// requests.
pub const TOKEN_HEADER: &str = "Sharaq-Token";

/// Value stored under the processing-lock key while a transform is in
/// flight.
const PROCESSING_SENTINEL: &str = "XXX";

/// Marshals incoming requests to the storage backend: fetches resolve
/// or fall back to the origin, stores and deletes are token-gated and
/// single-flighted through the processing lock.
#[derive(Clone)]
pub struct Dispatcher(Arc<Inner>);

struct Inner {
    backend: Arc<StorageBackend>,
    cache: Arc<UrlCache>,
    whitelist: Vec<Regex>,
    tokens: Vec<String>,
    lock_ttl: u64,
    scheduler: Scheduler,
    access_log: Option<Arc<AccessLog>>,
}

/// How a deferred transform is executed once the client got its 302.
enum Scheduler {
    /// Detached task under the server-scoped shutdown signal.
    Detached { shutdown: watch::Receiver<bool> },
    /// Enqueue to an external queue that drives the admin store path.
    Queue {
        endpoint: String,
        token: Option<String>,
        client: reqwest::Client,
    },
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        backend: Arc<StorageBackend>,
        cache: Arc<UrlCache>,
        shutdown: watch::Receiver<bool>,
        access_log: Option<Arc<AccessLog>>,
    ) -> Result<Self> {
        let mut whitelist = Vec::with_capacity(config.whitelist.len());
        for pat in &config.whitelist {
            let re = Regex::new(pat)
                .map_err(|e| SharaqError::Config(format!("invalid whitelist pattern: {}", e)))?;
            whitelist.push(re);
        }

        let scheduler = match &config.queue {
            Some(q) => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .map_err(|e| {
                        SharaqError::Config(format!("failed to create queue client: {}", e))
                    })?;
                Scheduler::Queue {
                    endpoint: q.addr.clone(),
                    token: config.tokens.first().cloned(),
                    client,
                }
            }
            None => Scheduler::Detached { shutdown },
        };

        Ok(Self(Arc::new(Inner {
            backend,
            cache,
            whitelist,
            tokens: config.tokens.clone(),
            lock_ttl: config.url_cache.process_lock_ttl,
            scheduler,
            access_log,
        })))
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/favicon.ico", any(|| async { StatusCode::NOT_FOUND }))
            .fallback(dispatch)
            .layer(middleware::from_fn_with_state(
                self.clone(),
                write_access_log,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    fn is_allowed(&self, target: &Url) -> bool {
        if self.0.whitelist.is_empty() {
            return true;
        }
        self.0
            .whitelist
            .iter()
            .any(|re| re.is_match(target.as_str()))
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if token.is_empty() || !self.0.tokens.iter().any(|t| t == token) {
            return Err(SharaqError::NotAuthorized);
        }
        Ok(())
    }

    async fn mark_processing(&self, target: &Url) -> Result<()> {
        let key = make_cache_key(&["processing", target.as_str()]);
        self.0
            .cache
            .set_nx(&key, PROCESSING_SENTINEL, Some(self.0.lock_ttl as u32))
            .await
    }

    async fn unmark_processing(&self, target: &Url) -> Result<()> {
        let key = make_cache_key(&["processing", target.as_str()]);
        self.0.cache.delete(&key).await
    }

    /// Replies with the proper URL of the image.
    async fn handle_fetch(&self, params: &Params) -> Result<Response> {
        let target = target_url(params)?;
        let preset = preset_from(params)?;

        if !self.is_allowed(&target) {
            return Err(SharaqError::NotAllowed);
        }

        match self.0.backend.get(&target, &preset).await {
            Ok(Resolved::Redirect(location)) => Ok((
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, location)],
            )
                .into_response()),
            Ok(Resolved::File(path)) => serve_file(&path).await,
            Err(SharaqError::TransformationRequired) => {
                // do not block the client on the transformation; let it
                // fetch the original while we build derivatives
                if let Err(e) = self.schedule_deferred(&target).await {
                    error!("failed to schedule transform for {}: {}", target, e);
                }
                Ok((
                    StatusCode::FOUND,
                    [(header::LOCATION, target.to_string())],
                )
                    .into_response())
            }
            Err(e) => Err(e),
        }
    }

    /// Accepts PUT/POST requests to build and store derivatives.
    async fn handle_store(&self, headers: &HeaderMap, params: &Params) -> Result<Response> {
        self.authorize(headers)?;
        let target = target_url(params)?;

        // don't process the same url while somebody else is processing it
        self.mark_processing(&target).await?;
        let result = self.0.backend.store_transformed_content(&target).await;
        if let Err(e) = self.unmark_processing(&target).await {
            warn!("failed to release processing lock for {}: {}", target, e);
        }
        result?;

        Ok(StatusCode::NO_CONTENT.into_response())
    }

    /// Accepts DELETE requests to drop all derivatives for a url.
    async fn handle_delete(&self, headers: &HeaderMap, params: &Params) -> Result<Response> {
        self.authorize(headers)?;
        let target = target_url(params)?;

        self.mark_processing(&target).await?;
        let result = self.0.backend.delete(&target).await;
        if let Err(e) = self.unmark_processing(&target).await {
            warn!("failed to release processing lock for {}: {}", target, e);
        }
        result?;

        Ok(StatusCode::NO_CONTENT.into_response())
    }

    async fn schedule_deferred(&self, target: &Url) -> Result<()> {
        match &self.0.scheduler {
            Scheduler::Detached { shutdown } => {
                let backend = self.0.backend.clone();
                let cache = self.0.cache.clone();
                let lock_ttl = self.0.lock_ttl;
                let shutdown = shutdown.clone();
                let target = target.clone();
                tokio::spawn(run_deferred(backend, cache, lock_ttl, shutdown, target));
                Ok(())
            }
            Scheduler::Queue {
                endpoint,
                token,
                client,
            } => {
                let mut req = client.post(endpoint).body(target.to_string());
                if let Some(token) = token {
                    req = req.header(TOKEN_HEADER, token);
                }
                let res = req.send().await.map_err(|e| {
                    SharaqError::Storage(format!("failed to enqueue transform: {}", e))
                })?;
                if !res.status().is_success() {
                    return Err(SharaqError::Storage(format!(
                        "transform queue returned {}",
                        res.status()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// The transform itself follows the same mark/store/unmark sequence the
/// admin path uses; if another replica picked the url up first the lock
/// refuses and this task quietly stands down.
async fn run_deferred(
    backend: Arc<StorageBackend>,
    cache: Arc<UrlCache>,
    lock_ttl: u64,
    mut shutdown: watch::Receiver<bool>,
    target: Url,
) {
    let work = async {
        let key = make_cache_key(&["processing", target.as_str()]);
        if let Err(e) = cache
            .set_nx(&key, PROCESSING_SENTINEL, Some(lock_ttl as u32))
            .await
        {
            debug!("url {} is already being processed: {}", target, e);
            return;
        }

        if let Err(e) = backend.store_transformed_content(&target).await {
            error!("deferred transformation for {} failed: {}", target, e);
        }

        if let Err(e) = cache.delete(&key).await {
            warn!("failed to release processing lock for {}: {}", target, e);
        }
    };

    tokio::select! {
        _ = work => {}
        _ = shutdown.changed() => {
            debug!("server shutting down, abandoning transform for {}", target);
        }
    }
}

type Params = Vec<(String, String)>;

fn parse_params(uri: &Uri, body: &[u8]) -> Params {
    let mut params: Params = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    // hosted queues post the url back as a form body
    params.extend(url::form_urlencoded::parse(body).into_owned());
    params
}

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn target_url(params: &Params) -> Result<Url> {
    let raw = match param(params, "url") {
        Some(raw) if !raw.is_empty() => raw,
        _ => {
            // a bare url may also arrive as the whole body of a queue
            // callback; form parsing then yields a key with no value
            match params.iter().find(|(k, _)| k.starts_with("http")) {
                Some((k, v)) if v.is_empty() => k.as_str(),
                _ => return Err(SharaqError::BadRequest("url parameter missing".into())),
            }
        }
    };

    let u = Url::parse(raw)
        .map_err(|e| SharaqError::BadRequest(format!("invalid url: {}", e)))?;
    if u.scheme() != "http" && u.scheme() != "https" {
        return Err(SharaqError::BadRequest(format!(
            "scheme '{}' not supported",
            u.scheme()
        )));
    }
    if u.host_str().map_or(true, str::is_empty) {
        return Err(SharaqError::BadRequest("empty host".into()));
    }
    Ok(u)
}

fn preset_from(params: &Params) -> Result<String> {
    if let Some(preset) = param(params, "preset") {
        if !preset.is_empty() {
            return Ok(preset.to_string());
        }
    }
    // deprecated alias, still accepted
    if let Some(device) = param(params, "device") {
        if !device.is_empty() {
            return Ok(device.to_string());
        }
    }
    Err(SharaqError::BadRequest("preset parameter missing".into()))
}

async fn serve_file(path: &Path) -> Result<Response> {
    let body = tokio::fs::read(path)
        .await
        .map_err(|e| SharaqError::Storage(format!("failed to read {}: {}", path.display(), e)))?;
    let content_type = sniff_content_type(&body);
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn dispatch(
    State(dispatcher): State<Dispatcher>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let params = parse_params(&uri, &body);

    let result = match method {
        Method::GET => dispatcher.handle_fetch(&params).await,
        Method::PUT | Method::POST => dispatcher.handle_store(&headers, &params).await,
        Method::DELETE => dispatcher.handle_delete(&headers, &params).await,
        _ => Err(SharaqError::BadRequest("unsupported method".into())),
    };

    result.unwrap_or_else(|e| e.into_response())
}

async fn write_access_log(
    State(dispatcher): State<Dispatcher>,
    req: Request,
    next: Next,
) -> Response {
    let Some(access_log) = dispatcher.0.access_log.clone() else {
        return next.run(req).await;
    };

    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let referer = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let res = next.run(req).await;

    let bytes_sent = res
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0u64);
    access_log
        .record(
            client.as_deref(),
            &method,
            &uri,
            res.status().as_u16(),
            bytes_sent,
            referer.as_deref(),
            user_agent.as_deref(),
        )
        .await;

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UrlCacheConfig;
    use crate::transform::Transformer;
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config
            .presets
            .insert("small".to_string(), "100x100".to_string());
        config.backend.root = root.to_string_lossy().into_owned();
        config.tokens = vec!["AbCdEfG".to_string()];
        // nothing listens here; cache reads degrade to misses
        config.url_cache = UrlCacheConfig {
            addr: vec!["127.0.0.1:1".to_string()],
            ..UrlCacheConfig::default()
        };
        config
    }

    fn test_router(config: &Config) -> Router {
        let cache = Arc::new(UrlCache::new(&config.url_cache).unwrap());
        let transformer = Arc::new(Transformer::new().unwrap());
        let backend =
            Arc::new(StorageBackend::new(config, cache.clone(), transformer).unwrap());
        let (_tx, rx) = watch::channel(false);
        Dispatcher::new(config, backend, cache, rx, None)
            .unwrap()
            .router()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn missing_query_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&test_config(dir.path()));

        let res = app.oneshot(get("/")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_preset_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&test_config(dir.path()));

        let res = app
            .oneshot(get("/?url=https://example.com/a.png"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn favicon_short_circuits_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&test_config(dir.path()));

        let res = app.oneshot(get("/favicon.ico")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsupported_method_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&test_config(dir.path()));

        let req = Request::builder()
            .method(Method::PATCH)
            .uri("/?url=https://example.com/a.png")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn store_requires_a_configured_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // no token at all
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/?url=https://example.com/a.png")
            .body(Body::empty())
            .unwrap();
        let res = test_router(&config).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        // a token outside the configured set
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/?url=https://example.com/a.png")
            .header(TOKEN_HEADER, "nope")
            .body(Body::empty())
            .unwrap();
        let res = test_router(&config).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        // good token but no url: the auth gate passed, the request is bad
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/")
            .header(TOKEN_HEADER, "AbCdEfG")
            .body(Body::empty())
            .unwrap();
        let res = test_router(&config).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_requires_a_configured_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/?url=https://example.com/a.png")
            .body(Body::empty())
            .unwrap();
        let res = test_router(&config).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/")
            .header(TOKEN_HEADER, "AbCdEfG")
            .body(Body::empty())
            .unwrap();
        let res = test_router(&config).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn whitelist_blocks_unlisted_origins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.whitelist = vec!["^https://allow\\.example/".to_string()];
        let app = test_router(&config);

        let res = app
            .oneshot(get("/?url=https://deny.example/a.png&preset=small"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn whitelisted_origin_passes_through_to_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.whitelist = vec!["^https://allow\\.example/".to_string()];
        let app = test_router(&config);

        // no derivative exists, so the fallback 302s to the origin
        let res = app
            .oneshot(get("/?url=https://allow.example/a.png&preset=small"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn cold_miss_redirects_to_the_origin() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&test_config(dir.path()));

        let res = app
            .oneshot(get("/?url=https://example.com/a.png&preset=small"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(
            res.headers().get(header::LOCATION).unwrap(),
            "https://example.com/a.png"
        );
    }

    #[tokio::test]
    async fn existing_derivative_is_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // place a derivative where the fs backend expects it
        let origin = "https://example.com/a.png";
        let path = dir.path().join(crate::backend::hashed_path("small", origin));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0xff, 0xd8, 0xff, 0xe0]).unwrap();

        let app = test_router(&config);
        let res = app
            .oneshot(get(&format!("/?url={}&preset=small", origin)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
    }

    #[tokio::test]
    async fn legacy_device_parameter_still_selects_the_preset() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&test_config(dir.path()));

        let res = app
            .oneshot(get("/?url=https://example.com/a.png&device=small"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
    }

    #[test]
    fn queue_callback_body_supplies_the_url() {
        let params = parse_params(
            &"/".parse().unwrap(),
            b"url=https%3A%2F%2Fexample.com%2Fa.png",
        );
        assert_eq!(
            target_url(&params).unwrap().as_str(),
            "https://example.com/a.png"
        );

        // a bare url body, the way a naive queue posts it back
        let params = parse_params(&"/".parse().unwrap(), b"https://example.com/a.png");
        assert_eq!(
            target_url(&params).unwrap().as_str(),
            "https://example.com/a.png"
        );
    }

    #[test]
    fn target_url_rejects_non_http_schemes() {
        let params = vec![("url".to_string(), "ftp://example.com/a.png".to_string())];
        assert!(matches!(
            target_url(&params),
            Err(SharaqError::BadRequest(_))
        ));
    }
}
