use crate::generator::GeneratorOutput;
use crate::merge::FieldMerge;
use crate::pipeline::{FileOutcome, PipelineError};
use crate::stage::{Stage, WriteOutcome};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyRuleError {
    #[error("merge copy source '{0}' must name exactly one file")]
    AmbiguousMergeSource(PathBuf),
}

/// Whether a copy source can only name a tree or a set of files: empty, `.`,
/// a trailing separator, or a glob.
pub fn is_directory_shaped(source: &str) -> bool {
    let trimmed = source.trim();
    trimmed.is_empty()
        || trimmed == "."
        || trimmed.ends_with('/')
        || trimmed.ends_with('\\')
        || trimmed.contains('*')
}

/// Copy one file or directory from a generator output into the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRule {
    source: PathBuf,
    dest: PathBuf,
    merge: Option<FieldMerge>,
}

impl CopyRule {
    /// Plain overwrite copy.
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            merge: None,
        }
    }

    /// Copy into the same relative path in the destination.
    pub fn mirror(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(path.clone(), path)
    }

    /// Copy a single file through a merge.
    ///
    /// Sources that can only denote a tree (see [`is_directory_shaped`]) are
    /// rejected here; a source that turns out to be a
    /// directory in the generated tree is rejected when the rule runs.
    pub fn with_merge(
        source: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        merge: FieldMerge,
    ) -> Result<Self, CopyRuleError> {
        let source = source.into();
        if is_directory_shaped(&source.as_os_str().to_string_lossy()) {
            return Err(CopyRuleError::AmbiguousMergeSource(source));
        }
        Ok(Self {
            source,
            dest: dest.into(),
            merge: Some(merge),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn merge(&self) -> Option<&FieldMerge> {
        self.merge.as_ref()
    }

    pub fn describe(&self) -> String {
        let mut text = format!(
            "copy {} -> {}",
            self.source.display(),
            self.dest.display()
        );
        if let Some(merge) = &self.merge {
            let fields: Vec<&str> = merge.fields().iter().map(|f| f.as_str()).collect();
            text.push_str(&format!(" (merge {})", fields.join(", ")));
        }
        text
    }

    /// Run the copy against `output`, staging every write.
    pub fn apply(
        &self,
        output: &GeneratorOutput,
        stage: &mut Stage,
    ) -> Result<Vec<FileOutcome>, PipelineError> {
        crate::safety::check_relative(&self.source)
            .map_err(|source| PipelineError::safety(self.describe(), source))?;

        let source = output.path(&self.source);

        if source.is_file() {
            return Ok(vec![self.copy_file(&source, &self.dest, stage)?]);
        }

        if source.is_dir() {
            if self.merge.is_some() {
                return Err(PipelineError::AmbiguousMergeSource {
                    rule: self.describe(),
                    path: self.source.clone(),
                });
            }
            return self.copy_tree(&source, stage);
        }

        Err(PipelineError::MissingTargetFile {
            rule: self.describe(),
            path: source,
            suggestions: Vec::new(),
        })
    }

    /// Union copy: every file under `root` lands under `dest`, nothing in
    /// `dest` is removed.
    fn copy_tree(&self, root: &Path, stage: &mut Stage) -> Result<Vec<FileOutcome>, PipelineError> {
        let mut outcomes = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                PipelineError::io(self.describe(), path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or_else(|_| entry.path());
            let dest = self.dest.join(rel);
            outcomes.push(self.copy_file(entry.path(), &dest, stage)?);
        }

        Ok(outcomes)
    }

    fn copy_file(
        &self,
        source: &Path,
        dest: &Path,
        stage: &mut Stage,
    ) -> Result<FileOutcome, PipelineError> {
        let generated = fs::read_to_string(source)
            .map_err(|e| PipelineError::io(self.describe(), source.to_path_buf(), e))?;

        let (content, preserved) = match &self.merge {
            Some(merge) => {
                let existing = stage
                    .read(dest)
                    .map_err(|e| PipelineError::stage(self.describe(), e))?;
                let merged = merge.merge(&generated, existing.as_deref());
                if existing.is_some() && merged.preserved.len() < merge.fields().len() {
                    warn!(
                        file = %dest.display(),
                        kept = ?merged.preserved,
                        "existing file lacks a merged field, generator value used"
                    );
                }
                (merged.content, Some(merged.preserved))
            }
            None => (generated, None),
        };

        let outcome = stage
            .write(dest, content)
            .map_err(|e| PipelineError::stage(self.describe(), e))?;

        let file = dest.to_path_buf();
        Ok(match (outcome, preserved) {
            (WriteOutcome::Unchanged, _) => FileOutcome::Unchanged { file },
            (WriteOutcome::Changed, Some(preserved)) => {
                debug!(file = %dest.display(), ?preserved, "merged");
                FileOutcome::Merged { file, preserved }
            }
            (WriteOutcome::Changed, None) => {
                debug!(file = %dest.display(), "copied");
                FileOutcome::Copied { file }
            }
        })
    }
}
