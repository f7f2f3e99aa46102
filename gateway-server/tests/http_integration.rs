use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use gateway_config::ConfigRegistry;
use gateway_core::{Coalescer, DiskRenditionCache, FsCache};
use gateway_server::scheduler::RequestScheduler;
use gateway_server::stats::StatsCollector;
use gateway_server::transcoder::Transcoder;
use gateway_server::webdav::WebdavMount;
use gateway_server::{http, AppState};

async fn test_state(root: PathBuf) -> AppState {
    let config_path = root.join("gateway.conf");
    let registry = Arc::new(ConfigRegistry::load(config_path).await);
    let cache_dir = root.join("cache");
    let rendition_cache = Arc::new(DiskRenditionCache::init(cache_dir, 10_240).await);
    let fs_cache = Arc::new(FsCache::new(100, 100, Duration::from_secs(60)));

    AppState {
        config: registry,
        root: root.clone(),
        webdav: WebdavMount::new(root.clone(), Arc::clone(&fs_cache), 2000),
        fs_cache,
        rendition_cache,
        coalescer: Coalescer::new(Duration::from_secs(30)),
        scheduler: RequestScheduler::new(64, 16, Duration::from_millis(0)),
        transcoder: Transcoder::new(2, "magick"),
        stats: StatsCollector::new(root.join("stats.json")),
    }
}

/// S6: a `PROPFIND` carrying `Depth: infinity` is rejected before it ever
/// reaches the delegated WebDAV handler.
#[tokio::test]
async fn propfind_depth_infinity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path().to_path_buf()).await;
    let app = http::router(state);
    let server = TestServer::new(app).unwrap();

    let response = server
        .method(axum::http::Method::from_bytes(b"PROPFIND").unwrap(), "/")
        .add_header(axum::http::header::HeaderName::from_static("depth"), "infinity")
        .await;

    response.assert_status(axum::http::StatusCode::FORBIDDEN);
    response.assert_text("Depth infinity is not supported.");
}

/// A request for a source path that doesn't exist on disk 404s rather than
/// panicking or falling through to the WebDAV mount.
#[tokio::test]
async fn image_get_for_missing_source_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path().to_path_buf()).await;
    let app = http::router(state);
    let server = TestServer::new(app).unwrap();

    let response = server.get("/nope.jpg").await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}

/// Path traversal in the image fast path is rejected before any filesystem
/// access happens, matching the safe-resolve contract in §4.1/§6.
#[tokio::test]
async fn image_get_rejects_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path().to_path_buf()).await;
    let app = http::router(state);
    let server = TestServer::new(app).unwrap();

    let response = server.get("/../../etc/passwd.jpg").await;
    assert_ne!(response.status_code(), axum::http::StatusCode::OK);
}

/// Static settings assets under `/setting/*` are served with a derived
/// content type, or 404 when absent.
#[tokio::test]
async fn settings_data_endpoint_returns_config_text() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path().to_path_buf()).await;
    let app = http::router(state);
    let server = TestServer::new(app).unwrap();

    let response = server.get("/setting/data").await;
    response.assert_status_ok();
}
