use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

const TEXT_EXTENSIONS: &[&str] = &["html", "htm", "css", "js", "json", "xml", "txt", "md"];
const MIN_COMPRESSIBLE_LEN: usize = 1024;

pub fn is_text_extension(extension: &str) -> bool {
    TEXT_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    accept_encoding
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

/// Gzip-conditions a body: compresses at level 9 and returns the compressed
/// bytes only if doing so clears the configured savings threshold; otherwise
/// returns the original bytes untouched. The caller decides headers based on
/// which branch of [`ConditionedBody`] comes back.
///
/// Grounded in the ecosystem's common `flate2` usage pattern (the reference
/// codebase itself has no text-compression path, so this is adapted from the
/// broader example corpus rather than from the teacher).
pub fn condition(body: &[u8], threshold: f32) -> ConditionedBody {
    if body.len() < MIN_COMPRESSIBLE_LEN {
        return ConditionedBody::Uncompressed(body.to_vec());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(9));
    if encoder.write_all(body).is_err() {
        return ConditionedBody::Uncompressed(body.to_vec());
    }
    let Ok(compressed) = encoder.finish() else {
        return ConditionedBody::Uncompressed(body.to_vec());
    };
    let ratio = compressed.len() as f32 / body.len() as f32;
    if ratio < threshold {
        ConditionedBody::Gzipped(compressed)
    } else {
        ConditionedBody::Uncompressed(body.to_vec())
    }
}

pub enum ConditionedBody {
    Gzipped(Vec<u8>),
    Uncompressed(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_body_is_never_compressed() {
        let body = b"tiny".to_vec();
        match condition(&body, 0.9) {
            ConditionedBody::Uncompressed(b) => assert_eq!(b, body),
            ConditionedBody::Gzipped(_) => panic!("should not compress a short body"),
        }
    }

    #[test]
    fn highly_compressible_body_is_gzipped() {
        let body = vec![b'a'; 10_000];
        match condition(&body, 0.3) {
            ConditionedBody::Gzipped(compressed) => {
                assert!(compressed.len() < body.len());
            }
            ConditionedBody::Uncompressed(_) => panic!("should have compressed a repetitive body"),
        }
    }

    #[test]
    fn extensions_and_accept_encoding_are_recognized() {
        assert!(is_text_extension("HTML"));
        assert!(!is_text_extension("jpg"));
        assert!(accepts_gzip(Some("gzip, deflate")));
        assert!(!accepts_gzip(Some("br")));
        assert!(!accepts_gzip(None));
    }
}
