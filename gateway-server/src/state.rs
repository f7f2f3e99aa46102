use std::path::PathBuf;
use std::sync::Arc;

use gateway_core::{Coalescer, DiskRenditionCache, FsCache};

use crate::scheduler::RequestScheduler;
use crate::stats::StatsCollector;
use crate::transcoder::Transcoder;
use crate::webdav::WebdavMount;

/// Shared application state threaded through every axum handler.
///
/// Grounded on the reference server's `AppState` (a plain `Clone` struct of
/// `Arc`-wrapped services passed to `Router::with_state`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<gateway_config::ConfigRegistry>,
    pub root: PathBuf,
    pub fs_cache: Arc<FsCache>,
    pub rendition_cache: Arc<DiskRenditionCache>,
    pub coalescer: Coalescer,
    pub scheduler: RequestScheduler,
    pub transcoder: Transcoder,
    pub stats: Arc<StatsCollector>,
    pub webdav: WebdavMount,
}
