//! Mapping from virtual paths to backing-store paths.

use std::path::{Path, PathBuf};

/// Translates virtual paths (as seen on the mount, always starting with `/`)
/// into paths inside the backing directory.
///
/// The backing root is fixed at mount time. Trailing separators on the root
/// are stripped so that concatenation never produces `//`; the virtual path
/// is appended verbatim. `.` and `..` components are the dispatch layer's
/// problem, not ours.
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: String,
}

impl PathMapper {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_string_lossy();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// The backing root directory.
    pub fn root(&self) -> PathBuf {
        if self.root.is_empty() {
            // the configured root was "/" (or a run of slashes)
            PathBuf::from("/")
        } else {
            PathBuf::from(&self.root)
        }
    }

    /// The backing path for a virtual path.
    pub fn backing(&self, vpath: &str) -> PathBuf {
        debug_assert!(vpath.starts_with('/'), "virtual path must be rooted");
        PathBuf::from(format!("{}{}", self.root, vpath))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_backing() {
        let m = PathMapper::new("/srv/data");
        assert_eq!(m.backing("/"), PathBuf::from("/srv/data/"));
        assert_eq!(m.backing("/a/b.txt"), PathBuf::from("/srv/data/a/b.txt"));
    }

    #[test]
    fn test_trailing_separators_stripped() {
        let m = PathMapper::new("/srv/data/");
        assert_eq!(m.backing("/a"), PathBuf::from("/srv/data/a"));
        let m = PathMapper::new("/srv/data///");
        assert_eq!(m.backing("/a"), PathBuf::from("/srv/data/a"));
    }

    #[test]
    fn test_root_is_slash() {
        let m = PathMapper::new("/");
        assert_eq!(m.backing("/a"), PathBuf::from("/a"));
        assert_eq!(m.root(), PathBuf::from("/"));
    }

    #[test]
    fn test_root_accessor() {
        let m = PathMapper::new("/srv/data/");
        assert_eq!(m.root(), PathBuf::from("/srv/data"));
    }
}
