pub mod engines;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engines::{primary_engine_supports, FallbackEngine, PrimaryEngine};

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub long_edge: u32,
    pub quality: u8,
    pub fast_mode: bool,
    pub pixel_limit: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to decode source image: {0}")]
    Decode(String),
    #[error("source exceeds pixel limit ({width}x{height})")]
    PixelLimitExceeded { width: u32, height: u32 },
    #[error("fallback engine failed to start: {0}")]
    FallbackSpawn(String),
    #[error("fallback engine timed out")]
    FallbackTimeout,
    #[error("fallback engine exited with error: {0}")]
    FallbackExit(String),
    #[error("client disconnected before the render completed")]
    Cancelled,
    #[error("all engines failed, and the original could not be read: {0}")]
    AllEnginesFailed(String),
}

pub enum RenderOutcome {
    Webp(Vec<u8>),
    /// All engines failed; caller should stream the original bytes verbatim.
    OriginalPassthrough,
}

/// Streaming-pipeline orchestrator: primary engine -> fallback engine ->
/// original passthrough, process-wide gated by a swappable concurrency
/// limiter.
///
/// Grounded on the reference transcoding `WorkerPool`'s escalation ladder
/// (hardware encoder -> software encoder) and its `tokio::process::Command`
/// spawn/monitor/kill lifecycle; adapted from video-frame pipelines down to
/// a single-shot image render with a two-engine chain plus passthrough.
#[derive(Clone)]
pub struct Transcoder {
    limiter: Arc<Mutex<Arc<Semaphore>>>,
    fallback: Arc<FallbackEngine>,
}

impl Transcoder {
    pub fn new(max_concurrency: usize, magick_path: impl Into<String>) -> Self {
        Self {
            limiter: Arc::new(Mutex::new(Arc::new(Semaphore::new(max_concurrency.max(1))))),
            fallback: Arc::new(FallbackEngine::new(magick_path)),
        }
    }

    /// Replaces the concurrency limiter in place (e.g. after a config
    /// reload). In-flight permits issued from the old semaphore keep working
    /// until their holders finish; only new acquires see the new cap. Shared
    /// across every clone of this `Transcoder` via the `Mutex`, so a
    /// background config-watch task holding its own clone still retunes the
    /// limiter the HTTP handlers' clone actually acquires from.
    pub fn retune_concurrency(&self, max_concurrency: usize) {
        let mut limiter = self.limiter.lock().expect("limiter mutex poisoned");
        *limiter = Arc::new(Semaphore::new(max_concurrency.max(1)));
    }

    pub async fn render(
        &self,
        source_path: &Path,
        source_bytes: Arc<Vec<u8>>,
        opts: RenderOptions,
        cancel: CancellationToken,
    ) -> Result<RenderOutcome, TranscodeError> {
        let semaphore = Arc::clone(&self.limiter.lock().expect("limiter mutex poisoned"));
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
        };

        let extension = source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        if primary_engine_supports(&extension) {
            let primary_result = tokio::select! {
                res = run_primary(source_bytes, opts.clone()) => res,
                _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
            };
            match primary_result {
                Ok(bytes) => return Ok(RenderOutcome::Webp(bytes)),
                Err(err) => warn!(error = %err, "primary engine failed, escalating to fallback"),
            }
        } else {
            info!(extension = %extension, "primary engine does not support format, routing to fallback");
        }

        let fallback_result = tokio::select! {
            res = self.fallback.render(source_path, &opts) => res,
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
        };
        match fallback_result {
            Ok(bytes) => Ok(RenderOutcome::Webp(bytes)),
            Err(err) => {
                warn!(error = %err, "fallback engine failed, falling back to original bytes");
                Ok(RenderOutcome::OriginalPassthrough)
            }
        }
    }
}

const PRIMARY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the primary engine under a hard 5s timeout. A primary engine that
/// blocks past that (a pathological image, a decoder stuck in a loop) is
/// treated the same as a primary failure: `render` escalates to the fallback
/// engine rather than waiting indefinitely on one transcoder permit.
async fn run_primary(
    source_bytes: Arc<Vec<u8>>,
    opts: RenderOptions,
) -> Result<Vec<u8>, TranscodeError> {
    let task = tokio::task::spawn_blocking(move || PrimaryEngine::render(&source_bytes, &opts));
    match tokio::time::timeout(PRIMARY_TIMEOUT, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(TranscodeError::Decode(e.to_string())),
        Err(_) => Err(TranscodeError::Decode("primary engine timed out after 5s".to_string())),
    }
}

/// Chooses a [`RenderOptions`] from the request's image mode and requested
/// quality, following §4.6's mode table (fast / balanced / high-compression).
pub fn options_for_mode(
    image_mode: u8,
    photo_size: u32,
    quality: u8,
    pixel_limit: u64,
) -> RenderOptions {
    RenderOptions {
        long_edge: photo_size,
        quality,
        fast_mode: image_mode == 1,
        pixel_limit,
    }
}

pub fn content_type_for_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        "heic" | "heif" => "image/heic",
        _ => "application/octet-stream",
    }
}

pub fn is_image_extension(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase()
            .as_str(),
        "jpg" | "jpeg" | "png" | "tiff" | "tif" | "bmp" | "avif" | "heic" | "heif"
    )
}

pub fn cache_dir_default() -> PathBuf {
    PathBuf::from("cache/renditions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_image_extensions() {
        assert!(is_image_extension(Path::new("a.JPG")));
        assert!(is_image_extension(Path::new("a.heic")));
        assert!(!is_image_extension(Path::new("a.txt")));
    }

    #[test]
    fn fast_mode_only_for_image_mode_one() {
        let opts = options_for_mode(1, 1600, 60, 1_000_000);
        assert!(opts.fast_mode);
        let opts = options_for_mode(2, 1600, 60, 1_000_000);
        assert!(!opts.fast_mode);
    }

    #[test]
    fn heic_routes_to_fallback_only() {
        assert!(!primary_engine_supports("heic"));
        assert!(!primary_engine_supports("HEIF"));
        assert!(primary_engine_supports("jpg"));
    }
}
