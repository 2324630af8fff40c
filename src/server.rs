use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::access_log::AccessLog;
use crate::backend::StorageBackend;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::transform::Transformer;
use crate::urlcache::UrlCache;

/// Environment variable through which a process manager hands down
/// already-bound sockets, as `addr=fd` pairs separated by `;`.
const INHERITED_PORTS_ENV: &str = "SERVER_STARTER_PORT";

/// Owns the serve loop: builds the component stack, serves until a
/// signal arrives, reloads on SIGHUP and drains on termination.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP")?;
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
        let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT")?;

        loop {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let cache = Arc::new(UrlCache::new(&self.config.url_cache)?);
            let transformer = Arc::new(Transformer::new()?);
            let backend = Arc::new(StorageBackend::new(
                &self.config,
                cache.clone(),
                transformer,
            )?);
            let access_log = match &self.config.access_log {
                Some(cfg) => Some(Arc::new(AccessLog::new(cfg)?)),
                None => None,
            };
            let dispatcher = Dispatcher::new(
                &self.config,
                backend,
                cache,
                shutdown_rx.clone(),
                access_log,
            )?;

            let listener = bind_listener(&self.config.listen).await?;
            info!("dispatcher listening on {}", self.config.listen);

            let mut graceful = shutdown_rx.clone();
            let serve = axum::serve(
                listener,
                dispatcher
                    .router()
                    .into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = graceful.changed().await;
            });
            let serve = std::future::IntoFuture::into_future(serve);
            tokio::pin!(serve);

            let reload = tokio::select! {
                res = &mut serve => {
                    res.context("server error")?;
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("reload request received, shutting down for reload");
                    self.reload_config().await;
                    true
                }
                _ = sigterm.recv() => false,
                _ = sigint.recv() => false,
                _ = sigquit.recv() => false,
            };

            // cancel the serve scope; in-flight requests drain, detached
            // transforms observe the signal and stand down
            let _ = shutdown_tx.send(true);
            if let Err(e) = serve.await {
                warn!("error while draining: {}", e);
            }

            if !reload {
                info!("termination request received, shutting down");
                return Ok(());
            }
        }
    }

    /// Re-read the config file. A config that fails to parse or
    /// validate leaves the running config in force.
    async fn reload_config(&mut self) {
        let Some(path) = self.config.filename.clone() else {
            warn!("no config file to reload");
            return;
        };
        match Config::load(&path).await {
            Ok(new_config) => {
                self.config = new_config;
                if self.config.debug {
                    self.config.dump();
                }
            }
            Err(e) => {
                error!("failed to reload config file {}: {}", path.display(), e);
            }
        }
    }
}

/// Bind the listen address, preferring a socket inherited from the
/// process manager when one matches.
async fn bind_listener(addr: &str) -> Result<TcpListener> {
    if let Ok(spec) = std::env::var(INHERITED_PORTS_ENV) {
        let fd = inherited_fd(&spec, addr)
            .with_context(|| format!("no inherited listener matches {}", addr))?;
        info!("adopting inherited listener for {} (fd {})", addr, fd);

        let std_listener = unsafe {
            use std::os::fd::FromRawFd;
            std::net::TcpListener::from_raw_fd(fd)
        };
        std_listener
            .set_nonblocking(true)
            .context("failed to set inherited listener non-blocking")?;
        return TcpListener::from_std(std_listener).context("failed to adopt inherited listener");
    }

    TcpListener::bind(addr)
        .await
        .with_context(|| format!("error listening on {}", addr))
}

/// Find the file descriptor for `addr` in an `addr=fd;...` spec. A bare
/// port entry matches any-interface binds on that port.
fn inherited_fd(spec: &str, addr: &str) -> Option<i32> {
    for part in spec.split(';') {
        let Some((spec_addr, fd)) = part.split_once('=') else {
            continue;
        };
        let matches = spec_addr == addr
            || (!spec_addr.contains(':') && addr == format!("0.0.0.0:{}", spec_addr));
        if matches {
            return fd.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherited_fd_matches_full_addresses() {
        assert_eq!(
            inherited_fd("0.0.0.0:9090=3", "0.0.0.0:9090"),
            Some(3)
        );
        assert_eq!(
            inherited_fd("127.0.0.1:8080=4;0.0.0.0:9090=5", "0.0.0.0:9090"),
            Some(5)
        );
        assert_eq!(inherited_fd("0.0.0.0:9091=3", "0.0.0.0:9090"), None);
    }

    #[test]
    fn inherited_fd_matches_bare_ports() {
        assert_eq!(inherited_fd("9090=3", "0.0.0.0:9090"), Some(3));
        assert_eq!(inherited_fd("9091=3", "0.0.0.0:9090"), None);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        assert_eq!(inherited_fd("garbage;0.0.0.0:9090=7", "0.0.0.0:9090"), Some(7));
        assert_eq!(inherited_fd("0.0.0.0:9090=notafd", "0.0.0.0:9090"), None);
    }
}
