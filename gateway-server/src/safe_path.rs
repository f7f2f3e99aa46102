use std::path::{Component, Path, PathBuf};

use crate::error::AppError;

/// Resolves a URL path against `root`, rejecting any result that would
/// escape it. Decoding happens before this is called (axum already
/// percent-decodes `Path` extractors); this function's job is purely the
/// `..`/absolute-component containment check, done lexically so it works
/// even against paths that do not yet exist on disk.
pub fn safe_resolve(root: &Path, url_path: &str) -> Result<PathBuf, AppError> {
    let trimmed = url_path.trim_start_matches('/');
    let mut resolved = root.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::forbidden("path escapes library root"));
            }
        }
    }
    if !resolved.starts_with(root) {
        return Err(AppError::forbidden("path escapes library root"));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_path_resolves_under_root() {
        let root = Path::new("/lib");
        let resolved = safe_resolve(root, "/a/b/photo.jpg").unwrap();
        assert_eq!(resolved, PathBuf::from("/lib/a/b/photo.jpg"));
    }

    #[test]
    fn parent_dir_component_is_rejected() {
        let root = Path::new("/lib");
        assert!(safe_resolve(root, "/../etc/passwd").is_err());
        assert!(safe_resolve(root, "/a/../../etc/passwd").is_err());
    }

    #[test]
    fn dot_components_are_harmless() {
        let root = Path::new("/lib");
        let resolved = safe_resolve(root, "/./a/./b.jpg").unwrap();
        assert_eq!(resolved, PathBuf::from("/lib/a/b.jpg"));
    }
}
