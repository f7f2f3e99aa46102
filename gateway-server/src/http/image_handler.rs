use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use gateway_core::coalescer::Entry;
use gateway_core::{LongEdge, PendingWrite, RenditionKey, RenditionSpec};

use crate::error::{AppError, AppResult};
use crate::safe_path::safe_resolve;
use crate::scheduler::{Rejection, RequestScheduler, TimeoutKind};
use crate::transcoder::{self, RenderOutcome};
use crate::AppState;

const OUTER_TIMEOUT: Duration = Duration::from_secs(8);
const INNER_TIMEOUT: Duration = Duration::from_secs(6);
const TEE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub q: Option<u8>,
}

/// Handles a `GET` whose extension is in the image set: the full C2 -> C4 ->
/// C3 -> C6 path described in §4.8.
///
/// Grounded on the reference server's `image_handlers::serve_image_handler`
/// for the overall extractor/handler shape (`Query` + `State`, building
/// `HeaderMap` by hand, `(headers, bytes).into_response()`), generalized
/// from a database-backed media lookup to a filesystem-path-backed rendition
/// pipeline.
pub async fn serve(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<ImageQuery>,
) -> AppResult<Response> {
    let root = state.root.clone();
    let scheduler = state.scheduler.clone();
    let source_path = safe_resolve(&root, uri.path())?;
    let stat = state.fs_cache.stat(&source_path).await;
    if !stat.is_file {
        return Err(AppError::not_found("source image not found"));
    }

    let config = state.config.current();
    if !config.image_conversion_enabled {
        return stream_original(&source_path).await;
    }

    let quality = config.clamp_quality(query.q);
    let spec = RenditionSpec {
        source_path: source_path.to_string_lossy().into_owned(),
        long_edge: LongEdge::Pixels(config.photo_size),
        quality,
        source_mtime_ms: stat.mtime_ms,
        source_len: stat.len,
    };
    let key = RenditionKey::compute(&spec);

    if let Some(hit) = state.rendition_cache.lookup(&key).await {
        return Ok(webp_response_buffered(
            tokio::fs::read(&hit.path).await.map_err(AppError::from)?,
            hit.len,
            hit.mtime_ms,
        ));
    }

    let admission = match scheduler.admit(source_path.clone()).await {
        Ok(a) => a,
        Err(Rejection::ShedOverload) => {
            return Err(AppError::service_unavailable("server overloaded, try again"))
        }
        Err(Rejection::CancelledFolderSwitch) => {
            return Err(AppError::gone("request cancelled due to folder change"))
        }
    };
    let _admission = admission;

    match state.coalescer.enter(&key) {
        Entry::Leader(leader) => {
            let outcome = run_with_timeout(build_and_publish(
                &state,
                &source_path,
                &key,
                quality,
                stat.mtime_ms,
                &config,
            ))
            .await;
            leader.release();
            outcome
        }
        Entry::Follower(follower) => {
            run_with_timeout(async {
                follower.wait().await;
                Ok(())
            })
            .await?;
            if let Some(hit) = state.rendition_cache.lookup(&key).await {
                Ok(webp_response_buffered(
                    tokio::fs::read(&hit.path).await.map_err(AppError::from)?,
                    hit.len,
                    hit.mtime_ms,
                ))
            } else {
                // leader's build did not produce a cache entry (ineligible
                // size, or it fell through to original passthrough); fall
                // back to serving the original ourselves rather than
                // looping, since re-entering risks duplicate work under the
                // watchdog's 30s window.
                stream_original(&source_path).await
            }
        }
    }
}

/// Races `fut` against the outer/inner timeout pair from §4.5, translating a
/// timeout into a 408 the way the rest of the handler translates rejections
/// into their own status codes. `fut` itself never returns an `AppError`
/// here for anything other than an already-built `AppResult`, so this only
/// ever adds the timeout outcome on top.
async fn run_with_timeout<T>(fut: impl std::future::Future<Output = AppResult<T>>) -> AppResult<T> {
    match RequestScheduler::run_with_timeouts(OUTER_TIMEOUT, INNER_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(TimeoutKind::Outer) => Err(AppError::request_timeout("request exceeded the 8s outer timeout")),
        Err(TimeoutKind::Inner) => Err(AppError::request_timeout("render exceeded the 6s inner timeout")),
    }
}

async fn build_and_publish(
    state: &AppState,
    source_path: &PathBuf,
    key: &RenditionKey,
    quality: u8,
    source_mtime_ms: i64,
    config: &gateway_config::ConfigSnapshot,
) -> AppResult<Response> {
    let source_bytes = match tokio::fs::read(source_path).await {
        Ok(b) => Arc::new(b),
        Err(_) => return Err(AppError::not_found("source image not found")),
    };

    let opts = transcoder::options_for_mode(
        config.image_mode,
        config.photo_size,
        quality,
        config.sharp_pixel_limit,
    );
    let cancel = CancellationToken::new();
    let outcome = state
        .transcoder
        .render(source_path, Arc::clone(&source_bytes), opts, cancel)
        .await;

    let rendered = match outcome {
        Ok(RenderOutcome::Webp(bytes)) => bytes,
        Ok(RenderOutcome::OriginalPassthrough) => {
            state
                .stats
                .record_image(source_bytes.len() as u64, source_bytes.len() as u64);
            return Ok(original_response(&source_bytes, source_path));
        }
        Err(crate::transcoder::TranscodeError::Cancelled) => {
            return Err(AppError::gone("client disconnected"))
        }
        Err(err) => {
            error!(error = %err, "transcode failed on every engine");
            return Err(AppError::internal("transcode failed"));
        }
    };

    state
        .stats
        .record_image(source_bytes.len() as u64, rendered.len() as u64);

    let writer = if state.rendition_cache.is_eligible(source_bytes.len() as u64) {
        state.rendition_cache.begin_write(key).await.ok()
    } else {
        None
    };

    Ok(tee_webp_response(rendered, writer, source_mtime_ms))
}

async fn stream_original(source_path: &PathBuf) -> AppResult<Response> {
    let bytes = tokio::fs::read(source_path).await.map_err(AppError::from)?;
    Ok(original_response(&bytes, source_path))
}

fn original_response(bytes: &[u8], source_path: &PathBuf) -> Response {
    let content_type = transcoder::content_type_for_extension(source_path);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    (headers, Body::from(bytes.to_vec())).into_response()
}

/// Builds the headers common to every image response: content type, the
/// keep-alive pair, `Last-Modified` derived from the source's mtime, and an
/// `ETag` keyed on length+mtime. Shared by the cache-hit (buffered) and
/// live-render (streamed) response paths so neither drifts from the other.
fn webp_headers(len: u64, mtime_ms: i64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/webp"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
    headers.insert(
        HeaderName::from_static("keep-alive"),
        HeaderValue::from_static("timeout=600"),
    );
    if let Some(last_modified) = http_date(mtime_ms) {
        headers.insert(header::LAST_MODIFIED, last_modified);
    }
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&format!("\"{len}-{mtime_ms}\"")).unwrap(),
    );
    headers
}

fn http_date(mtime_ms: i64) -> Option<HeaderValue> {
    let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(mtime_ms / 1000, 0)?;
    HeaderValue::from_str(&dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()).ok()
}

/// Cache-hit path: the rendition already exists on disk, so there is nothing
/// to tee and a plain buffered body (with a correct `Content-Length`) is the
/// simplest correct response.
fn webp_response_buffered(bytes: Vec<u8>, len: u64, mtime_ms: i64) -> Response {
    let headers = webp_headers(len, mtime_ms);
    (StatusCode::OK, headers, Body::from(bytes)).into_response()
}

/// Live-render path: forks the just-rendered bytes to the disk-cache writer
/// and the HTTP response body concurrently, chunk by chunk, instead of
/// writing the whole buffer to disk and then wrapping the same buffer in a
/// fixed-length body. `Body::from_stream` has no known length, so axum sends
/// this as `Transfer-Encoding: chunked`, matching the live-render headers
/// contract. The client disconnecting doesn't stop the cache file from being
/// completed; a failed cache write doesn't stop the response from streaming.
fn tee_webp_response(rendered: Vec<u8>, writer: Option<PendingWrite>, mtime_ms: i64) -> Response {
    let len = rendered.len() as u64;
    let headers = webp_headers(len, mtime_ms);

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(tee_to_cache_and_channel(rendered, writer, tx));

    let body = Body::from_stream(ReceiverStream::new(rx));
    (StatusCode::OK, headers, body).into_response()
}

async fn tee_to_cache_and_channel(
    rendered: Vec<u8>,
    mut writer: Option<PendingWrite>,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut offset = 0usize;
    let mut client_gone = false;
    while offset < rendered.len() {
        let end = (offset + TEE_CHUNK_SIZE).min(rendered.len());
        let chunk = Bytes::copy_from_slice(&rendered[offset..end]);

        if let Some(w) = writer.as_mut() {
            if let Err(err) = w.write_all(&chunk).await {
                warn!(error = %err, "cache write failed mid-stream, aborting disk sink only");
                let stale = writer.take();
                if let Some(w) = stale {
                    w.abort().await;
                }
            }
        }

        if !client_gone && tx.send(Ok(chunk)).await.is_err() {
            // client disconnected; keep looping so the cache file still gets
            // a complete rendition even though nobody's listening anymore.
            client_gone = true;
        }

        offset = end;
    }

    if let Some(writer) = writer {
        if let Err(err) = writer.publish().await {
            warn!(error = %err, "failed to publish rendition to disk cache");
        }
    }
}
