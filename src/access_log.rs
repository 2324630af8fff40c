use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::AccessLogConfig;
use crate::error::{Result, SharaqError};

/// Combined-format access log with period-based rotation, a symlink to
/// the live file and max-age retention.
pub struct AccessLog {
    config: AccessLogConfig,
    tz: Option<Tz>,
    writer: Mutex<Option<Writer>>,
}

struct Writer {
    path: PathBuf,
    file: tokio::fs::File,
}

impl AccessLog {
    pub fn new(config: &AccessLogConfig) -> Result<Self> {
        if config.log_file.is_empty() {
            return Err(SharaqError::Config("access log requires 'LogFile'".into()));
        }

        let tz = match &config.location {
            Some(name) => Some(name.parse::<Tz>().map_err(|e| {
                SharaqError::Config(format!("invalid timezone '{}': {}", name, e))
            })?),
            None => None,
        };

        Ok(Self {
            config: config.clone(),
            tz,
            writer: Mutex::new(None),
        })
    }

    /// Append one request in combined log format.
    pub async fn record(
        &self,
        client: Option<&str>,
        method: &str,
        uri: &str,
        status: u16,
        bytes_sent: u64,
        referer: Option<&str>,
        user_agent: Option<&str>,
    ) {
        let now = Utc::now();
        let line = format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"\n",
            client.unwrap_or("-"),
            self.format_time(now, "%d/%b/%Y:%H:%M:%S %z"),
            method,
            uri,
            status,
            bytes_sent,
            referer.unwrap_or("-"),
            user_agent.unwrap_or("-"),
        );

        if let Err(e) = self.write_line(now, &line).await {
            warn!("failed to write access log: {}", e);
        }
    }

    fn format_time(&self, t: DateTime<Utc>, fmt: &str) -> String {
        match self.tz {
            Some(tz) => t.with_timezone(&tz).format(fmt).to_string(),
            None => t.format(fmt).to_string(),
        }
    }

    /// Current log file for a point in time: the configured path plus a
    /// suffix naming the start of the rotation period.
    fn current_path(&self, t: DateTime<Utc>) -> PathBuf {
        let rotation = self.config.rotation_time.max(1) as i64;
        let period_start = t.timestamp() - t.timestamp().rem_euclid(rotation);
        let stamp = self.format_time(
            Utc.timestamp_opt(period_start, 0).single().unwrap_or(t),
            "%Y%m%d%H%M",
        );
        PathBuf::from(format!("{}.{}", self.config.log_file, stamp))
    }

    async fn write_line(&self, now: DateTime<Utc>, line: &str) -> Result<()> {
        let path = self.current_path(now);
        let mut writer = self.writer.lock().await;

        let rotate = writer.as_ref().map_or(true, |w| w.path != path);
        if rotate {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!("access log rotated to {}", path.display());

            if let Some(link) = &self.config.link_name {
                let _ = tokio::fs::remove_file(link).await;
                if let Err(e) = tokio::fs::symlink(&path, link).await {
                    warn!("failed to update access log symlink {}: {}", link, e);
                }
            }

            *writer = Some(Writer {
                path: path.clone(),
                file,
            });

            if self.config.max_age > 0 {
                tokio::spawn(sweep_rotated(
                    self.config.log_file.clone(),
                    Duration::from_secs(self.config.max_age),
                ));
            }
        }

        if let Some(w) = writer.as_mut() {
            w.file.write_all(line.as_bytes()).await?;
            w.file.flush().await?;
        }
        Ok(())
    }
}

/// Remove rotated files older than the retention period.
async fn sweep_rotated(log_file: String, max_age: Duration) {
    let base = PathBuf::from(&log_file);
    let Some(dir) = base.parent() else { return };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let Some(prefix) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return;
    };
    let prefix = format!("{}.", prefix);

    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let expired = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if expired {
            debug!("removing rotated access log {}", name);
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}
