use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::loader::{load_from_path, parse, save_to_path, LoadOutcome};
use crate::snapshot::ConfigSnapshot;

/// Owns the current [`ConfigSnapshot`] and a background poller that reloads
/// it from disk on a fixed cadence, publishing changes over a
/// `tokio::sync::watch` channel the way the reference server's background
/// tasks fan out state changes.
pub struct ConfigRegistry {
    path: PathBuf,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl ConfigRegistry {
    /// Loads the initial snapshot. If the file is missing or unreadable the
    /// registry still starts, serving defaults, since the gateway should not
    /// refuse to boot over a missing settings file.
    pub async fn load(path: PathBuf) -> Self {
        let snapshot = match load_from_path(&path).await {
            Ok(LoadOutcome { snapshot, warnings }) => {
                log_warnings(&warnings);
                snapshot
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "config file unreadable, using defaults");
                ConfigSnapshot::default()
            }
        };
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        Self { path, tx }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn raw_text(&self) -> String {
        tokio::fs::read_to_string(&self.path).await.unwrap_or_default()
    }

    pub async fn save(&self, content: &str) -> crate::error::Result<()> {
        save_to_path(&self.path, content).await?;
        self.reload_once().await;
        Ok(())
    }

    async fn reload_once(&self) {
        match load_from_path(&self.path).await {
            Ok(LoadOutcome { snapshot, warnings }) => {
                log_warnings(&warnings);
                let previous = self.tx.borrow().clone();
                if *previous != snapshot {
                    log_diff(&previous, &snapshot);
                    let _ = self.tx.send(Arc::new(snapshot));
                }
            }
            Err(err) => warn!(error = %err, "config reload failed, keeping previous snapshot"),
        }
    }

    /// Spawns the reload poller; stops when `shutdown` is triggered.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.reload_once().await,
                    _ = shutdown.cancelled() => {
                        info!("config poller shutting down");
                        break;
                    }
                }
            }
        });
    }
}

fn log_warnings(warnings: &[crate::loader::ConfigWarning]) {
    for w in warnings {
        warn!(key = %w.key, value = %w.raw_value, reason = %w.reason, "invalid config value, using default");
    }
}

fn log_diff(old: &ConfigSnapshot, new: &ConfigSnapshot) {
    macro_rules! diff {
        ($field:ident) => {
            if old.$field != new.$field {
                info!(key = stringify!($field), old = ?old.$field, new = ?new.$field, "config value changed");
            }
        };
    }
    diff!(default_quality);
    diff!(photo_size);
    diff!(max_concurrency);
    diff!(sharp_memory_limit_mb);
    diff!(sharp_pixel_limit);
    diff!(cache_ttl_ms);
    diff!(cache_min_size);
    diff!(stack_max_size);
    diff!(compression_enabled);
    diff!(image_conversion_enabled);
    diff!(restart_enabled);
    diff!(restart_time);
    diff!(port);
}

/// Re-parses `text` without touching disk; used by the settings UI to
/// validate a draft before saving.
pub fn preview(text: &str) -> LoadOutcome {
    parse(text)
}
