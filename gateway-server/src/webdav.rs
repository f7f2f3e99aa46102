use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use dav_server::davpath::DavPath;
use dav_server::fakels::FakeLs;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsResult, FsStream,
    OpenOptions, ReadDirMeta,
};
use dav_server::localfs::LocalFs;
use dav_server::DavHandler;
use futures_util::{FutureExt, StreamExt};
use tracing::debug;

use gateway_core::{FsCache, StatRecord};

use crate::conditioner::{self, ConditionedBody};
use crate::AppState;

/// Delegated WebDAV mount: everything that is not an image GET and not
/// under `/setting` lands here.
///
/// The protocol machinery itself (PROPFIND multistatus XML, locking,
/// OPTIONS) is handled entirely by the `dav-server` crate's `DavHandler`;
/// this gateway pre-filters `Depth: infinity` before delegating, and
/// gzip-conditions the response on the way out, exactly as §4.9 describes.
/// The filesystem backing the mount is [`CachingFs`], which reads `stat`
/// and directory listings through this gateway's own [`FsCache`] before
/// ever touching disk, and truncates listings to `max_list` the same way
/// the image/HTTP side of the gateway bounds its own caches.
#[derive(Clone)]
pub struct WebdavMount {
    handler: Arc<DavHandler>,
}

impl WebdavMount {
    pub fn new(root: PathBuf, fs_cache: Arc<FsCache>, max_list: usize) -> Self {
        let fs = CachingFs::new(root, fs_cache, max_list);
        let ls = FakeLs::new();
        let handler = DavHandler::builder()
            .filesystem(Box::new(fs))
            .locksystem(ls)
            .build_handler();
        Self {
            handler: Arc::new(handler),
        }
    }
}

/// `DavFileSystem` adapter over the gateway's `FsCache`.
///
/// Grounded on `dav-server`'s own `LocalFs` (the crate's stock local-disk
/// adapter): `metadata`/`symlink_metadata`/`read_dir` are rewritten here to
/// go through `FsCache::stat`/`read_dir` first; everything else (file I/O,
/// mutation) delegates straight to an inner `LocalFs`, which already does
/// the right thing and needs no caching.
#[derive(Clone)]
struct CachingFs {
    fs_cache: Arc<FsCache>,
    root: PathBuf,
    max_list: usize,
    inner: Box<LocalFs>,
}

impl fmt::Debug for CachingFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingFs")
            .field("root", &self.root)
            .field("max_list", &self.max_list)
            .finish()
    }
}

impl CachingFs {
    fn new(root: PathBuf, fs_cache: Arc<FsCache>, max_list: usize) -> Self {
        let inner = LocalFs::new(root.clone(), false, false, false);
        Self {
            fs_cache,
            root,
            max_list,
            inner,
        }
    }

    fn abs_path(&self, path: &DavPath) -> PathBuf {
        let mut pathbuf = self.root.clone();
        pathbuf.push(path.as_rel_ospath());
        pathbuf
    }
}

impl DavFileSystem for CachingFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let abs = self.abs_path(path);
            let record = self.fs_cache.stat(&abs).await;
            if !record.exists() {
                return Err(FsError::NotFound);
            }
            Ok(Box::new(CachedMeta(record)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn symlink_metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let abs = self.abs_path(path);
            let record = self.fs_cache.stat(&abs).await;
            if !record.exists() {
                return Err(FsError::NotFound);
            }
            Ok(Box::new(CachedMeta(record)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        async move {
            let abs = self.abs_path(path);
            let names = self.fs_cache.read_dir(&abs, self.max_list).await;
            let mut entries: Vec<Box<dyn DavDirEntry>> = Vec::with_capacity(names.len());
            for name in names.iter() {
                let record = self.fs_cache.stat(&abs.join(name)).await;
                entries.push(Box::new(CachedDirEntry {
                    name: name.clone(),
                    record,
                }) as Box<dyn DavDirEntry>);
            }
            Ok(futures_util::stream::iter(entries.into_iter().map(Ok::<_, FsError>)).boxed())
        }
        .boxed()
    }

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        self.inner.open(path, options)
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        self.inner.create_dir(path)
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        self.inner.remove_dir(path)
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        self.inner.remove_file(path)
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        self.inner.rename(from, to)
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        self.inner.copy(from, to)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedMeta(StatRecord);

impl DavMetaData for CachedMeta {
    fn len(&self) -> u64 {
        self.0.len
    }

    fn modified(&self) -> FsResult<SystemTime> {
        if self.0.mtime_ms < 0 {
            return Err(FsError::GeneralFailure);
        }
        Ok(UNIX_EPOCH + Duration::from_millis(self.0.mtime_ms as u64))
    }

    fn is_dir(&self) -> bool {
        self.0.is_dir
    }
}

#[derive(Debug)]
struct CachedDirEntry {
    name: String,
    record: StatRecord,
}

impl DavDirEntry for CachedDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let record = self.record;
        async move { Ok(Box::new(CachedMeta(record)) as Box<dyn DavMetaData>) }.boxed()
    }
}

pub async fn serve(
    State(state): State<AppState>,
    req: Request<Body>,
) -> axum::response::Response {
    if is_depth_infinity(&req) {
        debug!("rejecting PROPFIND with Depth: infinity");
        return (
            StatusCode::FORBIDDEN,
            "Depth infinity is not supported.",
        )
            .into_response();
    }

    let response = state.webdav.handler.handle(req).await.map(Body::new);
    condition_response(response, state.config.current().compression_threshold).await
}

fn is_depth_infinity(req: &Request<Body>) -> bool {
    req.headers()
        .get("depth")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("infinity"))
        .unwrap_or(false)
}

async fn condition_response(response: Response<Body>, threshold: f32) -> axum::response::Response {
    let is_text = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/") || ct.contains("xml") || ct.contains("json"))
        .unwrap_or(false);
    if !is_text {
        return response.into_response();
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, 32 * 1024 * 1024).await else {
        return (parts, Body::empty()).into_response();
    };

    match conditioner::condition(&bytes, threshold) {
        ConditionedBody::Gzipped(compressed) => {
            parts.headers.insert(
                axum::http::header::CONTENT_ENCODING,
                axum::http::HeaderValue::from_static("gzip"),
            );
            parts.headers.insert(
                axum::http::header::VARY,
                axum::http::HeaderValue::from_static("Accept-Encoding"),
            );
            parts.headers.insert(
                axum::http::header::CONTENT_LENGTH,
                axum::http::HeaderValue::from_str(&compressed.len().to_string()).unwrap(),
            );
            (parts, Body::from(compressed)).into_response()
        }
        ConditionedBody::Uncompressed(bytes) => (parts, Body::from(bytes)).into_response(),
    }
}
