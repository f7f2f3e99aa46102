use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::warn;

/// Minimal stand-in for the external logger/stats collector the gateway
/// delegates observability to; this only tracks what `/setting/stats` needs
/// to render, debounced to disk the same way the reference server treats
/// its own metrics flush.
#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    original_bytes: AtomicU64,
    optimized_bytes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CategoryStats {
        let original = self.original_bytes.load(Ordering::Relaxed);
        let optimized = self.optimized_bytes.load(Ordering::Relaxed);
        let saved = original.saturating_sub(optimized);
        let reduction_ratio = if original > 0 {
            saved as f64 / original as f64
        } else {
            0.0
        };
        CategoryStats {
            requests: self.requests.load(Ordering::Relaxed),
            original_bytes: original,
            optimized_bytes: optimized,
            saved_bytes: saved,
            reduction_ratio,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    requests: u64,
    original_bytes: u64,
    optimized_bytes: u64,
    saved_bytes: u64,
    reduction_ratio: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    totals: CategoryStats,
    categories: CategoriesSnapshot,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CategoriesSnapshot {
    image: CategoryStats,
    text: CategoryStats,
}

pub struct StatsCollector {
    image: Counters,
    text: Counters,
    dirty: Notify,
    flush_path: PathBuf,
}

impl StatsCollector {
    pub fn new(flush_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            image: Counters::default(),
            text: Counters::default(),
            dirty: Notify::new(),
            flush_path,
        })
    }

    pub fn record_image(&self, original_bytes: u64, optimized_bytes: u64) {
        self.image.requests.fetch_add(1, Ordering::Relaxed);
        self.image
            .original_bytes
            .fetch_add(original_bytes, Ordering::Relaxed);
        self.image
            .optimized_bytes
            .fetch_add(optimized_bytes, Ordering::Relaxed);
        self.dirty.notify_one();
    }

    pub fn record_text(&self, original_bytes: u64, optimized_bytes: u64) {
        self.text.requests.fetch_add(1, Ordering::Relaxed);
        self.text
            .original_bytes
            .fetch_add(original_bytes, Ordering::Relaxed);
        self.text
            .optimized_bytes
            .fetch_add(optimized_bytes, Ordering::Relaxed);
        self.dirty.notify_one();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let image = self.image.snapshot();
        let text = self.text.snapshot();
        let totals = CategoryStats {
            requests: image.requests + text.requests,
            original_bytes: image.original_bytes + text.original_bytes,
            optimized_bytes: image.optimized_bytes + text.optimized_bytes,
            saved_bytes: image.saved_bytes + text.saved_bytes,
            reduction_ratio: if image.original_bytes + text.original_bytes > 0 {
                (image.saved_bytes + text.saved_bytes) as f64
                    / (image.original_bytes + text.original_bytes) as f64
            } else {
                0.0
            },
        };
        StatsSnapshot {
            totals,
            categories: CategoriesSnapshot { image, text },
        }
    }

    /// Debounced flush loop: wakes on the next dirty notification, then
    /// waits out a short debounce window before writing, coalescing bursts
    /// of updates into a single disk write.
    pub async fn spawn_flusher(self: &Arc<Self>, debounce: Duration, shutdown: tokio_util::sync::CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.dirty.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => {}
                    _ = shutdown.cancelled() => break,
                }
                this.flush().await;
            }
            this.flush().await;
        });
    }

    async fn flush(&self) {
        let snapshot = self.snapshot();
        let Ok(json) = serde_json::to_vec_pretty(&snapshot) else {
            return;
        };
        if let Some(parent) = self.flush_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(&self.flush_path, json).await {
            warn!(error = %err, path = %self.flush_path.display(), "failed to flush stats snapshot");
        }
    }
}
