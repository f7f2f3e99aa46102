use std::path::Path;

use tracing::{debug, warn};

use super::{RenderOptions, TranscodeError};

/// HEIC-family extensions the primary (in-process) engine cannot decode;
/// these route straight to the fallback engine, same as the reference
/// worker's hardware/software split routes certain codecs straight to the
/// software path.
const PRIMARY_UNSUPPORTED_EXTENSIONS: &[&str] = &["heic", "heif"];

pub fn primary_engine_supports(extension: &str) -> bool {
    !PRIMARY_UNSUPPORTED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

/// In-process decode/resize/encode using the `image` crate for pixel work
/// and the `webp` crate for quality-controlled lossy encoding (the `image`
/// crate's own WebP encoder only writes lossless output). Stands in for the
/// libvips-class primary engine the original system shells out to.
pub struct PrimaryEngine;

impl PrimaryEngine {
    /// Runs fully synchronously; callers are expected to invoke this inside
    /// `tokio::task::spawn_blocking` since decode+resize+encode is CPU-bound,
    /// mirroring the reference thumbnail extractor's use of `spawn_blocking`
    /// around non-async-safe image work.
    pub fn render(source_bytes: &[u8], opts: &RenderOptions) -> Result<Vec<u8>, TranscodeError> {
        let img = image::load_from_memory(source_bytes)
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;

        let (w, h) = (img.width(), img.height());
        if (w as u64) * (h as u64) > opts.pixel_limit {
            return Err(TranscodeError::PixelLimitExceeded { width: w, height: h });
        }

        // Fast mode (IMAGE_MODE=1) skips EXIF rotation for speed; balanced
        // and high-compression modes apply it.
        let img = if opts.fast_mode {
            img
        } else {
            apply_exif_orientation(img, source_bytes)
        };
        let resized = resize_plan(&img, opts);
        let rgba = resized.to_rgba8();

        let encoder = webp::Encoder::from_rgba(&rgba, resized.width(), resized.height());
        let quality = opts.quality as f32;
        let memory = encoder.encode(quality);
        Ok(memory.to_vec())
    }
}

/// Reads the EXIF orientation tag (if any) and rotates/flips the decoded
/// buffer to match, since `image::load_from_memory` decodes pixels as
/// stored and ignores orientation. Mirrors the fallback engine's
/// `-auto-orient` flag so both engines agree on output orientation.
fn apply_exif_orientation(img: image::DynamicImage, source_bytes: &[u8]) -> image::DynamicImage {
    let mut cursor = std::io::Cursor::new(source_bytes);
    let orientation = exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|exif| exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY).cloned())
        .and_then(|field| field.value.get_uint(0));

    match orientation {
        Some(2) => img.fliph(),
        Some(3) => img.rotate180(),
        Some(4) => img.flipv(),
        Some(5) => img.rotate90().fliph(),
        Some(6) => img.rotate90(),
        Some(7) => img.rotate270().fliph(),
        Some(8) => img.rotate270(),
        _ => img,
    }
}

fn resize_plan(img: &image::DynamicImage, opts: &RenderOptions) -> image::DynamicImage {
    if opts.fast_mode {
        let target_w = opts.long_edge.min(img.width());
        let target_h = ((img.height() as u64 * target_w as u64) / img.width().max(1) as u64) as u32;
        img.resize_exact(target_w, target_h.max(1), image::imageops::FilterType::Triangle)
    } else {
        let short_edge = img.width().min(img.height());
        if short_edge <= opts.long_edge {
            img.clone()
        } else {
            img.resize(opts.long_edge, opts.long_edge, image::imageops::FilterType::Lanczos3)
        }
    }
}

/// Spawns an external `magick`/`convert`-class binary as the fallback
/// engine, mirroring the reference transcoding worker's
/// `tokio::process::Command` spawn-and-monitor pattern (minus the hardware
/// fallback ladder, which does not apply to a single-shot image convert).
pub struct FallbackEngine {
    pub binary_path: String,
}

impl FallbackEngine {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    pub async fn render(
        &self,
        source_path: &Path,
        opts: &RenderOptions,
    ) -> Result<Vec<u8>, TranscodeError> {
        let mut cmd = tokio::process::Command::new(&self.binary_path);
        cmd.arg(source_path)
            .arg("-auto-orient")
            .arg("-resize")
            .arg(format!("{}x{}>", opts.long_edge, opts.long_edge))
            .arg("-quality")
            .arg(opts.quality.to_string())
            .arg("webp:-")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        debug!(binary = %self.binary_path, ?source_path, "invoking fallback engine");

        let timeout = tokio::time::timeout(std::time::Duration::from_secs(15), cmd.output());
        let output = match timeout.await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TranscodeError::FallbackSpawn(e.to_string())),
            Err(_) => return Err(TranscodeError::FallbackTimeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(stderr = %stderr, "fallback engine exited non-zero");
            return Err(TranscodeError::FallbackExit(stderr));
        }
        if output.stdout.is_empty() {
            return Err(TranscodeError::FallbackExit("empty stdout".to_string()));
        }
        Ok(output.stdout)
    }
}
