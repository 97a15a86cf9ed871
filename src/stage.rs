//! Staging overlay for the destination tree.
//!
//! Every copy and patch in a synthesis run reads and writes through a
//! [`Stage`]. Nothing touches disk until [`Stage::commit`] is called, so a run
//! that aborts halfway leaves the destination exactly as it found it.

use crate::safety::{PathGuard, SafetyError};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Minimum similarity for a sibling file to be offered as a suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;
const MAX_SUGGESTIONS: usize = 3;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("File I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("File changed on disk since it was staged: {0}")]
    Modified(PathBuf),

    #[error(transparent)]
    Safety(#[from] SafetyError),
}

/// Result of staging a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "WriteOutcome reports whether the staged content changed"]
pub enum WriteOutcome {
    /// Staged content differs from what was there before
    Changed,
    /// Staged content is identical to the current content
    Unchanged,
}

/// A pending change, as seen by diff and dry-run reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChange<'a> {
    /// Path relative to the destination root
    pub path: &'a Path,
    /// Content on disk when the file was first staged (`None` if new)
    pub before: Option<&'a str>,
    /// Content that commit would write
    pub after: &'a str,
}

#[derive(Debug, Clone)]
struct StagedFile {
    original: Option<String>,
    current: String,
}

/// In-memory overlay of a destination tree.
#[derive(Debug)]
pub struct Stage {
    guard: PathGuard,
    files: BTreeMap<PathBuf, StagedFile>,
}

impl Stage {
    /// Create an empty overlay over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            guard: PathGuard::new(root),
            files: BTreeMap::new(),
        }
    }

    /// Destination root.
    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Read a file through the overlay.
    ///
    /// Returns `Ok(None)` when the file exists neither in the overlay nor on
    /// disk.
    pub fn read(&self, rel: &Path) -> Result<Option<String>, StageError> {
        let rel = key(rel);
        if let Some(staged) = self.files.get(&rel) {
            return Ok(Some(staged.current.clone()));
        }
        self.read_disk(&rel)
    }

    /// Whether a file is visible through the overlay.
    pub fn exists(&self, rel: &Path) -> Result<bool, StageError> {
        let rel = key(rel);
        if self.files.contains_key(&rel) {
            return Ok(true);
        }
        Ok(self.guard.resolve(&rel)?.is_file())
    }

    /// Stage `content` for `rel`, replacing whatever was there.
    pub fn write(&mut self, rel: &Path, content: String) -> Result<WriteOutcome, StageError> {
        let rel = key(rel);
        if let Some(staged) = self.files.get_mut(&rel) {
            if staged.current == content {
                return Ok(WriteOutcome::Unchanged);
            }
            staged.current = content;
            return Ok(WriteOutcome::Changed);
        }

        let original = self.read_disk(&rel)?;
        let outcome = if original.as_deref() == Some(content.as_str()) {
            WriteOutcome::Unchanged
        } else {
            WriteOutcome::Changed
        };
        self.files.insert(
            rel,
            StagedFile {
                original,
                current: content,
            },
        );
        Ok(outcome)
    }

    /// All staged files whose content differs from disk, in path order.
    pub fn changes(&self) -> Vec<StagedChange<'_>> {
        self.files
            .iter()
            .filter(|(_, staged)| staged.original.as_deref() != Some(staged.current.as_str()))
            .map(|(path, staged)| StagedChange {
                path,
                before: staged.original.as_deref(),
                after: &staged.current,
            })
            .collect()
    }

    /// Names of files near `rel` that look like it, for error messages.
    pub fn suggest(&self, rel: &Path) -> Vec<String> {
        let Some(wanted) = rel.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));

        let mut candidates: Vec<String> = self
            .files
            .keys()
            .filter(|p| p.parent() == Some(parent))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();

        if let Ok(dir) = self.guard.resolve(parent) {
            if let Ok(entries) = fs::read_dir(dir) {
                candidates.extend(
                    entries
                        .flatten()
                        .filter_map(|e| e.file_name().to_str().map(str::to_string)),
                );
            }
        }

        candidates.sort();
        candidates.dedup();

        let mut scored: Vec<(f64, String)> = candidates
            .into_iter()
            .map(|name| (strsim::jaro_winkler(wanted, &name), name))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, name)| parent.join(name).display().to_string())
            .collect()
    }

    /// Write every changed file to disk.
    ///
    /// Each file's on-disk content is re-checked against the fingerprint taken
    /// when it was staged before anything is written; a mismatch aborts the
    /// whole commit. Returns the committed paths relative to the root.
    pub fn commit(self) -> Result<Vec<PathBuf>, StageError> {
        let pending: Vec<(&PathBuf, &StagedFile)> = self
            .files
            .iter()
            .filter(|(_, staged)| staged.original.as_deref() != Some(staged.current.as_str()))
            .collect();

        for (rel, staged) in &pending {
            let on_disk = self.read_disk(rel)?;
            if on_disk.as_deref().map(fingerprint) != staged.original.as_deref().map(fingerprint) {
                return Err(StageError::Modified(rel.to_path_buf()));
            }
        }

        let mut committed = Vec::with_capacity(pending.len());
        for (rel, staged) in pending {
            let absolute = self.guard.resolve(rel)?;
            self.guard.check_existing(&absolute)?;

            if let Some(parent) = absolute.parent() {
                fs::create_dir_all(parent).map_err(|source| StageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }

            atomic_write(&absolute, staged.current.as_bytes()).map_err(|source| {
                StageError::Io {
                    path: absolute.clone(),
                    source,
                }
            })?;

            // Update mtime so downstream build tools notice the change
            filetime::set_file_mtime(&absolute, filetime::FileTime::now()).map_err(
                |source| StageError::Io {
                    path: absolute.clone(),
                    source,
                },
            )?;

            debug!(path = %rel.display(), "committed");
            committed.push(rel.clone());
        }

        Ok(committed)
    }

    fn read_disk(&self, rel: &Path) -> Result<Option<String>, StageError> {
        let absolute = self.guard.resolve(rel)?;
        match fs::read_to_string(&absolute) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StageError::Io {
                path: absolute,
                source,
            }),
        }
    }
}

/// Overlay key for `rel`, resolved lexically: `./Rakefile`, `lib/../Rakefile`
/// and `Rakefile` are the same file.
///
/// A `..` with nothing left to pop is kept, so the guard still rejects it.
fn key(rel: &Path) -> PathBuf {
    let mut key = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir
                if matches!(key.components().next_back(), Some(Component::Normal(_))) =>
            {
                key.pop();
            }
            other => key.push(other.as_os_str()),
        }
    }
    key
}

/// xxh3 fingerprint of file content.
pub fn fingerprint(content: &str) -> u64 {
    xxh3_64(content.as_bytes())
}

/// Atomic file write: tempfile + fsync + rename.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    // Tempfile in the same directory keeps the rename on one filesystem
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(ErrorKind::InvalidInput, "Path has no parent directory")
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_falls_through_to_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("README.md"), "on disk").unwrap();

        let stage = Stage::new(temp_dir.path());
        let content = stage.read(Path::new("README.md")).unwrap();
        assert_eq!(content.as_deref(), Some("on disk"));
        assert_eq!(stage.read(Path::new("missing.md")).unwrap(), None);
    }

    #[test]
    fn test_write_is_visible_before_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new(temp_dir.path());

        let outcome = stage
            .write(Path::new("lib/a.rb"), "staged".to_string())
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Changed);
        assert!(stage.exists(Path::new("lib/a.rb")).unwrap());
        assert_eq!(
            stage.read(Path::new("lib/a.rb")).unwrap().as_deref(),
            Some("staged")
        );
        assert!(!temp_dir.path().join("lib/a.rb").exists());
    }

    #[test]
    fn test_identical_write_is_unchanged() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("LICENSE"), "same").unwrap();

        let mut stage = Stage::new(temp_dir.path());
        let outcome = stage.write(Path::new("LICENSE"), "same".to_string()).unwrap();

        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert!(stage.changes().is_empty());
    }

    #[test]
    fn test_current_dir_prefix_is_same_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new(temp_dir.path());

        let _ = stage.write(Path::new("./Rakefile"), "a".to_string()).unwrap();
        let outcome = stage.write(Path::new("Rakefile"), "a".to_string()).unwrap();

        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(stage.changes().len(), 1);
    }

    #[test]
    fn test_parent_dir_alias_sees_staged_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new(temp_dir.path());

        let _ = stage
            .write(Path::new("lib/v1/a.rb"), "generated BUG\n".to_string())
            .unwrap();

        let aliased = Path::new("lib/v1/../v1/a.rb");
        assert!(stage.exists(aliased).unwrap());
        assert_eq!(
            stage.read(aliased).unwrap().as_deref(),
            Some("generated BUG\n")
        );
    }

    #[test]
    fn test_parent_dir_alias_is_one_staged_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join("lib/v1")).unwrap();
        fs::write(temp_dir.path().join("lib/v1/a.rb"), "old FIXED\n").unwrap();

        let mut stage = Stage::new(temp_dir.path());
        let _ = stage
            .write(Path::new("lib/v1/a.rb"), "generated BUG\n".to_string())
            .unwrap();

        // Must see the staged copy, not the stale file on disk
        let aliased = Path::new("lib/v1/../v1/a.rb");
        assert_eq!(
            stage.read(aliased).unwrap().as_deref(),
            Some("generated BUG\n")
        );
        let _ = stage
            .write(aliased, "generated FIXED\n".to_string())
            .unwrap();

        assert_eq!(stage.changes().len(), 1);
        let committed = stage.commit().unwrap();
        assert_eq!(committed, vec![PathBuf::from("lib/v1/a.rb")]);
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("lib/v1/a.rb")).unwrap(),
            "generated FIXED\n"
        );
    }

    #[test]
    fn test_unresolvable_parent_dir_still_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let stage = Stage::new(temp_dir.path());
        let result = stage.read(Path::new("lib/../../escape.rb"));
        assert!(matches!(result, Err(StageError::Safety(_))));
    }

    #[test]
    fn test_commit_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new(temp_dir.path());
        let _ = stage
            .write(Path::new("lib/google/cloud/a.rb"), "content".to_string())
            .unwrap();

        let committed = stage.commit().unwrap();

        assert_eq!(committed, vec![PathBuf::from("lib/google/cloud/a.rb")]);
        let written = fs::read_to_string(temp_dir.path().join("lib/google/cloud/a.rb")).unwrap();
        assert_eq!(written, "content");
    }

    #[test]
    fn test_commit_detects_concurrent_modification() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("Rakefile");
        fs::write(&file, "original").unwrap();

        let mut stage = Stage::new(temp_dir.path());
        let _ = stage
            .write(Path::new("Rakefile"), "generated".to_string())
            .unwrap();
        fs::write(&file, "edited by hand").unwrap();

        let result = stage.commit();
        assert!(matches!(result, Err(StageError::Modified(_))));
        assert_eq!(fs::read_to_string(&file).unwrap(), "edited by hand");
    }

    #[test]
    fn test_rejects_escaping_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new(temp_dir.path());
        let result = stage.write(Path::new("../escape.rb"), String::new());
        assert!(matches!(result, Err(StageError::Safety(_))));
    }

    #[test]
    fn test_suggest_similar_names() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join("lib")).unwrap();
        fs::write(temp_dir.path().join("lib/credentials.rb"), "").unwrap();
        fs::write(temp_dir.path().join("lib/unrelated.txt"), "").unwrap();

        let stage = Stage::new(temp_dir.path());
        let suggestions = stage.suggest(Path::new("lib/credential.rb"));

        assert_eq!(suggestions, vec!["lib/credentials.rb".to_string()]);
    }
}
