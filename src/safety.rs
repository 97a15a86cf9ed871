use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Boundary checks that keep rule paths inside the tree they address.
///
/// Rule files name every source and destination as a path relative to a
/// generator output or to the destination root. A guard rejects paths that
/// are absolute or climb out of that root, and re-checks existing directories
/// on disk so a symlink cannot redirect a write elsewhere.
#[derive(Debug, Clone)]
pub struct PathGuard {
    /// Root every relative path is resolved against
    root: PathBuf,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Path must be relative: {0}")]
    Absolute(PathBuf),

    #[error("Path escapes its root: {0}")]
    Escapes(PathBuf),

    #[error("Path is outside root: {path} (root: {root})")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Failed to canonicalize path: {0}")]
    Canonicalize(#[from] std::io::Error),
}

/// Lexically validate a rule path.
///
/// Accepts paths such as `lib/google/cloud/language/v1.rb` and `./Rakefile`;
/// rejects `/etc/passwd`, `../other`, and `a/../../b`.
pub fn check_relative(path: impl AsRef<Path>) -> Result<(), SafetyError> {
    let path = path.as_ref();
    let mut depth: usize = 0;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(SafetyError::Absolute(path.to_path_buf()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SafetyError::Escapes(path.to_path_buf()))?;
            }
            Component::Normal(_) => depth += 1,
        }
    }

    Ok(())
}

impl PathGuard {
    /// Create a guard for `root`. The root does not need to exist yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a rule path against the root after validating it.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
        let path = path.as_ref();
        check_relative(path)?;
        Ok(self.root.join(path))
    }

    /// Verify that the nearest existing ancestor of `absolute` lives under the
    /// canonical root.
    ///
    /// Call this immediately before writing: the file itself may not exist
    /// yet, but any directory it lands in must not be a symlink out of the
    /// tree.
    pub fn check_existing(&self, absolute: &Path) -> Result<(), SafetyError> {
        let root = self.root.canonicalize()?;

        let Some(existing) = absolute.ancestors().find(|p| p.exists()) else {
            return Ok(());
        };
        let canonical = existing.canonicalize()?;

        if !canonical.starts_with(&root) {
            return Err(SafetyError::OutsideRoot {
                path: canonical,
                root,
            });
        }

        Ok(())
    }

    /// Get the root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_relative_paths_accepted() {
        assert!(check_relative("lib/google/cloud/language.rb").is_ok());
        assert!(check_relative("./Rakefile").is_ok());
        assert!(check_relative("a/b/../c").is_ok());
    }

    #[test]
    fn test_absolute_path_rejected() {
        let result = check_relative("/etc/passwd");
        assert!(matches!(result, Err(SafetyError::Absolute(_))));
    }

    #[test]
    fn test_parent_escape_rejected() {
        assert!(matches!(
            check_relative("../outside.rb"),
            Err(SafetyError::Escapes(_))
        ));
        assert!(matches!(
            check_relative("lib/../../outside.rb"),
            Err(SafetyError::Escapes(_))
        ));
    }

    #[test]
    fn test_resolve_joins_root() {
        let guard = PathGuard::new("/tmp/dest");
        let resolved = guard.resolve("lib/a.rb").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/dest/lib/a.rb"));
    }

    #[test]
    fn test_check_existing_inside_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join("lib")).unwrap();
        let guard = PathGuard::new(temp_dir.path());

        let target = temp_dir.path().join("lib/new/file.rb");
        assert!(guard.check_existing(&target).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_check_existing_symlink_escape() {
        use std::os::unix::fs::symlink;

        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("dest");
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        symlink(&outside, root.join("lib")).unwrap();

        let guard = PathGuard::new(&root);
        let result = guard.check_existing(&root.join("lib/file.rb"));

        assert!(matches!(result, Err(SafetyError::OutsideRoot { .. })));
    }
}
