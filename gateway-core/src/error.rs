use std::path::PathBuf;

/// Errors surfaced by the cache, coalescer, and filesystem layers.
///
/// Recoverable conditions (a miss, a stale lease) are modeled as `Option`/`bool`
/// return values elsewhere; this enum is reserved for conditions a caller must
/// decide how to react to.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rendition cache directory {path} is not writable")]
    CacheDirUnwritable { path: PathBuf },

    #[error("source file not found: {0}")]
    NotFound(PathBuf),

    #[error("path escapes configured root: {0}")]
    PathEscape(PathBuf),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
