use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gateway_config::ConfigRegistry;
use gateway_core::{Coalescer, DiskRenditionCache, FsCache};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gateway_server::scheduler::RequestScheduler;
use gateway_server::stats::StatsCollector;
use gateway_server::transcoder::{self, Transcoder};
use gateway_server::webdav::WebdavMount;
use gateway_server::{http, AppState};

/// Photo library gateway: HTTP + WebDAV frontend serving adaptively
/// transcoded WebP renditions, backed by an on-disk rendition cache.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the KEY=VALUE settings file.
    #[arg(long, default_value = "gateway.conf")]
    config: PathBuf,

    /// Overrides the `PORT` setting if provided.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let shutdown = CancellationToken::new();

    // --- Init order: Config -> FS Cache -> Disk Cache -> Transcoder limits
    // -> Scheduler -> HTTP Frontend, per the lifecycle component's contract.
    let registry = Arc::new(ConfigRegistry::load(args.config.clone()).await);
    registry.spawn_poller(Duration::from_secs(10), shutdown.clone());
    let config = registry.current();

    let root = config.root_path.clone();
    let port = args.port.unwrap_or(config.port);

    let fs_cache = Arc::new(FsCache::new(10_000, 50_000, Duration::from_secs(3600)));

    let rendition_cache = Arc::new(
        DiskRenditionCache::init(
            transcoder::cache_dir_default(),
            config.cache_min_size,
        )
        .await,
    );
    spawn_cache_sweeper(Arc::clone(&rendition_cache), &config, shutdown.clone());

    let coalescer = Coalescer::new(Duration::from_secs(30));
    spawn_coalescer_watchdog(coalescer.clone(), shutdown.clone());

    let transcoder_svc = Transcoder::new(config.max_concurrency, config.magick_path.clone());
    spawn_concurrency_retuner(transcoder_svc.clone(), registry.subscribe(), shutdown.clone());

    let scheduler_svc = RequestScheduler::new(
        config.stack_max_size,
        config.stack_max_size * 3 / 10,
        Duration::from_millis(config.stack_processing_delay_ms),
    );
    spawn_stuck_detector(scheduler_svc.clone(), shutdown.clone());

    let stats_collector = StatsCollector::new(PathBuf::from("logs/stats.json"));
    stats_collector
        .spawn_flusher(Duration::from_secs(2), shutdown.clone())
        .await;

    let webdav_mount = WebdavMount::new(root.clone(), Arc::clone(&fs_cache), config.max_list);

    let state = AppState {
        config: Arc::clone(&registry),
        root,
        fs_cache,
        rendition_cache,
        coalescer,
        scheduler: scheduler_svc,
        transcoder: transcoder_svc,
        stats: stats_collector,
        webdav: webdav_mount,
    };

    spawn_restart_watcher(Arc::clone(&registry), shutdown.clone());
    spawn_health_log(state.clone(), shutdown.clone());
    spawn_shutdown_signal(shutdown.clone());

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "gateway listening");

    let shutdown_for_serve = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_for_serve.cancelled().await })
        .await?;

    Ok(())
}

fn spawn_cache_sweeper(
    cache: Arc<DiskRenditionCache>,
    config: &gateway_config::ConfigSnapshot,
    shutdown: CancellationToken,
) {
    let ttl = Duration::from_millis(config.cache_ttl_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30 * 60));
        loop {
            tokio::select! {
                _ = ticker.tick() => cache.sweep(ttl).await,
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

fn spawn_coalescer_watchdog(coalescer: Coalescer, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = coalescer.sweep_expired();
                    if expired > 0 {
                        warn!(expired, "force-cleared stale in-flight leases");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

/// Retunes the transcoder's concurrency limiter whenever `max_concurrency`
/// changes in the config file, per the lifecycle component's hot-reload
/// contract. `registry.subscribe()` and `Transcoder::retune_concurrency`
/// each already existed; this is the task that connects them.
fn spawn_concurrency_retuner(
    transcoder: Transcoder,
    mut changes: tokio::sync::watch::Receiver<Arc<gateway_config::ConfigSnapshot>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut current = changes.borrow().max_concurrency;
        loop {
            tokio::select! {
                result = changes.changed() => {
                    if result.is_err() {
                        break;
                    }
                    let new_max = changes.borrow().max_concurrency;
                    if new_max != current {
                        info!(old = current, new = new_max, "retuning transcoder concurrency");
                        transcoder.retune_concurrency(new_max);
                        current = new_max;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

fn spawn_stuck_detector(scheduler: RequestScheduler, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        loop {
            tokio::select! {
                _ = ticker.tick() => scheduler.detect_stuck(Duration::from_secs(5)).await,
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

fn spawn_restart_watcher(registry: Arc<ConfigRegistry>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let config = registry.current();
                    if !config.restart_enabled {
                        continue;
                    }
                    let tz: chrono_tz::Tz = "Asia/Tokyo".parse().unwrap_or(chrono_tz::UTC);
                    if gateway_config::restart::matches_restart_time(&config.restart_time, tz, chrono::Utc::now()) {
                        info!("scheduled restart time reached, exiting after grace period");
                        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
                        std::process::exit(0);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

fn spawn_health_log(state: AppState, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let buffer_depth = state.scheduler.depth().await;
                    info!(
                        in_flight = state.coalescer.in_flight_count(),
                        buffer_depth,
                        "health check"
                    );
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

/// Ctrl+C races against the shared cancellation token, matching the
/// reference bastion binary's shutdown wiring: one signal handler cancels
/// the token every background task and `axum::serve`'s graceful shutdown
/// future are already selecting on.
fn spawn_shutdown_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });
}
