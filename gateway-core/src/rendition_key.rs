use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Inputs that uniquely determine a rendition's bytes.
///
/// Two requests that agree on every field here are guaranteed to produce
/// byte-identical output, so the derived [`RenditionKey`] can be trusted as a
/// cache key without re-checking the source file on every hit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenditionSpec {
    pub source_path: String,
    pub long_edge: LongEdge,
    pub quality: u8,
    pub source_mtime_ms: i64,
    pub source_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LongEdge {
    Pixels(u32),
    Original,
}

impl fmt::Display for LongEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LongEdge::Pixels(p) => write!(f, "{p}"),
            LongEdge::Original => write!(f, "original"),
        }
    }
}

/// A 256-bit fingerprint of a [`RenditionSpec`], rendered as lowercase hex.
///
/// Stable across process restarts: the same spec always yields the same key,
/// which is what lets the disk cache survive a server restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenditionKey(String);

impl RenditionKey {
    pub fn compute(spec: &RenditionSpec) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(spec.source_path.as_bytes());
        hasher.update(b"\0");
        hasher.update(spec.long_edge.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(spec.quality.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(spec.source_mtime_ms.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(spec.source_len.to_string().as_bytes());
        let digest = hasher.finalize();
        Self(hex_lower(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the final, published cache entry (no directory prefix).
    pub fn file_name(&self) -> String {
        format!("{}.webp", self.0)
    }

    /// File name of an in-progress write; `nonce` must be unique per writer.
    pub fn tmp_file_name(&self, nonce: &str) -> String {
        format!("{}.webp.tmp-{nonce}", self.0)
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

impl fmt::Display for RenditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Builds a [`RenditionSpec`] from a source file's path and the metadata the
/// caller already fetched through the filesystem cache, avoiding a second stat.
pub fn spec_from_metadata(
    source_path: &Path,
    long_edge: LongEdge,
    quality: u8,
    mtime_ms: i64,
    len: u64,
) -> RenditionSpec {
    RenditionSpec {
        source_path: source_path.to_string_lossy().into_owned(),
        long_edge,
        quality,
        source_mtime_ms: mtime_ms,
        source_len: len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_for_identical_inputs() {
        let spec = RenditionSpec {
            source_path: "/lib/a/b.jpg".into(),
            long_edge: LongEdge::Pixels(1600),
            quality: 60,
            source_mtime_ms: 1_000,
            source_len: 3_000_000,
        };
        let k1 = RenditionKey::compute(&spec);
        let k2 = RenditionKey::compute(&spec);
        assert_eq!(k1, k2);
        assert!(RenditionKey::is_valid(k1.as_str()));
    }

    #[test]
    fn key_changes_when_mtime_changes() {
        let base = RenditionSpec {
            source_path: "/lib/a/b.jpg".into(),
            long_edge: LongEdge::Pixels(1600),
            quality: 60,
            source_mtime_ms: 1_000,
            source_len: 3_000_000,
        };
        let mut changed = base.clone();
        changed.source_mtime_ms = 1_001;
        assert_ne!(RenditionKey::compute(&base), RenditionKey::compute(&changed));
    }

    #[test]
    fn tmp_file_name_is_distinguishable_from_final() {
        let spec = RenditionSpec {
            source_path: "/lib/a/b.jpg".into(),
            long_edge: LongEdge::Original,
            quality: 80,
            source_mtime_ms: 0,
            source_len: 10,
        };
        let key = RenditionKey::compute(&spec);
        assert_ne!(key.file_name(), key.tmp_file_name("abc123"));
        assert!(key.tmp_file_name("abc123").starts_with(&key.file_name()));
    }
}
