//! Regex patch rules.
//!
//! A [`PatchRule`] runs one pattern over the whole content of each target
//! file, so patterns may span lines. Patterns that find nothing are a no-op:
//! rules are written to tolerate output where the defect is already fixed.

use crate::pipeline::{FileOutcome, PipelineError};
use crate::stage::{Stage, WriteOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How many matches a rule rewrites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceMode {
    /// Only the first match in each file
    First,
    /// Every non-overlapping match
    #[default]
    All,
}

impl ReplaceMode {
    fn limit(self) -> usize {
        match self {
            ReplaceMode::First => 1,
            ReplaceMode::All => 0,
        }
    }
}

impl fmt::Display for ReplaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceMode::First => f.write_str("first"),
            ReplaceMode::All => f.write_str("all"),
        }
    }
}

/// A compiled find-and-replace over one or more destination files.
#[derive(Debug, Clone)]
pub struct PatchRule {
    id: String,
    files: Vec<PathBuf>,
    regex: Regex,
    replacement: String,
    mode: ReplaceMode,
}

impl PatchRule {
    /// Compile a rule. `replacement` may reference groups as `${1}` or
    /// `${name}`.
    pub fn new(
        id: impl Into<String>,
        files: impl IntoIterator<Item = impl Into<PathBuf>>,
        pattern: &str,
        replacement: impl Into<String>,
        mode: ReplaceMode,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            files: files.into_iter().map(Into::into).collect(),
            regex: Regex::new(pattern)?,
            replacement: replacement.into(),
            mode,
        })
    }

    pub fn replace_first(
        id: impl Into<String>,
        files: impl IntoIterator<Item = impl Into<PathBuf>>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Self::new(id, files, pattern, replacement, ReplaceMode::First)
    }

    pub fn replace_all(
        id: impl Into<String>,
        files: impl IntoIterator<Item = impl Into<PathBuf>>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Self::new(id, files, pattern, replacement, ReplaceMode::All)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn mode(&self) -> ReplaceMode {
        self.mode
    }

    /// Human-readable description used in logs and error messages.
    pub fn describe(&self) -> String {
        format!(
            "patch '{}' ({}, /{}/)",
            self.id,
            self.mode,
            self.regex.as_str()
        )
    }

    /// Rewrite `content`, returning the result and the number of matches
    /// replaced.
    pub fn apply_to_str<'a>(&self, content: &'a str) -> (Cow<'a, str>, usize) {
        let matches = match self.mode {
            ReplaceMode::First => usize::from(self.regex.is_match(content)),
            ReplaceMode::All => self.regex.find_iter(content).count(),
        };
        if matches == 0 {
            return (Cow::Borrowed(content), 0);
        }
        let rewritten = self
            .regex
            .replacen(content, self.mode.limit(), self.replacement.as_str());
        (rewritten, matches)
    }

    /// Apply the rule to every target file in the stage.
    ///
    /// A target that does not exist is an error; a target the pattern does
    /// not match is reported as [`FileOutcome::NoMatch`].
    pub fn apply(&self, stage: &mut Stage) -> Result<Vec<FileOutcome>, PipelineError> {
        let mut outcomes = Vec::with_capacity(self.files.len());

        for file in &self.files {
            let content = self.read_target(stage, file)?;
            let (rewritten, replacements) = self.apply_to_str(&content);

            if replacements == 0 {
                debug!(rule = %self.id, file = %file.display(), "pattern matched nothing");
                outcomes.push(FileOutcome::NoMatch { file: file.clone() });
                continue;
            }

            let rewritten = rewritten.into_owned();
            let outcome = stage
                .write(file, rewritten)
                .map_err(|source| PipelineError::stage(self.describe(), source))?;

            match outcome {
                WriteOutcome::Changed => {
                    debug!(rule = %self.id, file = %file.display(), replacements, "patched");
                    outcomes.push(FileOutcome::Patched {
                        file: file.clone(),
                        replacements,
                    });
                }
                WriteOutcome::Unchanged => {
                    outcomes.push(FileOutcome::Unchanged { file: file.clone() });
                }
            }
        }

        Ok(outcomes)
    }

    fn read_target(&self, stage: &Stage, file: &Path) -> Result<String, PipelineError> {
        stage
            .read(file)
            .map_err(|source| PipelineError::stage(self.describe(), source))?
            .ok_or_else(|| PipelineError::MissingTargetFile {
                rule: self.describe(),
                path: file.to_path_buf(),
                suggestions: stage.suggest(file),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_replace_first_changes_one_occurrence() {
        let rule = PatchRule::replace_first("first", ["a.rb"], "foo", "bar").unwrap();
        let (out, n) = rule.apply_to_str("foo foo");
        assert_eq!(out, "bar foo");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_replace_all_changes_every_occurrence() {
        let rule = PatchRule::replace_all("all", ["a.rb"], "foo", "bar").unwrap();
        let (out, n) = rule.apply_to_str("foo foo");
        assert_eq!(out, "bar bar");
        assert_eq!(n, 2);
    }

    #[test]
    fn test_capture_groups_in_replacement() {
        let rule = PatchRule::replace_all(
            "suffix",
            ["test.rb"],
            "CustomTestError([^_])",
            "CustomTestError_v1${1}",
        )
        .unwrap();
        let input = "class CustomTestError < StandardError; end\nraise CustomTestError.new\n";
        let (out, n) = rule.apply_to_str(input);
        assert_eq!(
            out,
            "class CustomTestError_v1 < StandardError; end\nraise CustomTestError_v1.new\n"
        );
        assert_eq!(n, 2);

        // Suffixed names no longer match, so a second pass is a no-op
        let (again, n) = rule.apply_to_str(&out);
        assert_eq!(again, out);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_pattern_spans_lines() {
        let rule = PatchRule::replace_all(
            "swap",
            ["credentials.rb"],
            "LANGUAGE_KEYFILE\\n(\\s+)LANGUAGE_CREDENTIALS\\n",
            "LANGUAGE_CREDENTIALS\n${1}LANGUAGE_KEYFILE\n",
        )
        .unwrap();
        let input = "PATH_ENV_VARS = %w(LANGUAGE_KEYFILE\n                  LANGUAGE_CREDENTIALS\n";
        let (out, _) = rule.apply_to_str(input);
        assert_eq!(
            out,
            "PATH_ENV_VARS = %w(LANGUAGE_CREDENTIALS\n                  LANGUAGE_KEYFILE\n"
        );
    }

    #[test]
    fn test_no_match_borrows_input() {
        let rule = PatchRule::replace_all("none", ["a.rb"], "absent", "x").unwrap();
        let (out, n) = rule.apply_to_str("present");
        assert!(matches!(out, Cow::Borrowed("present")));
        assert_eq!(n, 0);
    }

    #[test]
    fn test_apply_reports_no_match_without_writing() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(".yardopts"), "--no-private\n").unwrap();

        let mut stage = Stage::new(temp_dir.path());
        let rule = PatchRule::replace_all("yard", [".yardopts"], "markup", "x").unwrap();
        let outcomes = rule.apply(&mut stage).unwrap();

        assert_eq!(
            outcomes,
            vec![FileOutcome::NoMatch {
                file: PathBuf::from(".yardopts")
            }]
        );
        assert!(stage.changes().is_empty());
    }

    #[test]
    fn test_apply_missing_file_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut stage = Stage::new(temp_dir.path());
        let rule = PatchRule::replace_all("missing", ["Rakefile"], "a", "b").unwrap();

        let result = rule.apply(&mut stage);
        assert!(matches!(
            result,
            Err(PipelineError::MissingTargetFile { .. })
        ));
    }

    #[test]
    fn test_apply_through_parent_dir_alias_patches_staged_copy() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join("lib/v1")).unwrap();
        fs::write(temp_dir.path().join("lib/v1/a.rb"), "old FIXED\n").unwrap();

        let mut stage = Stage::new(temp_dir.path());
        let _ = stage
            .write(Path::new("lib/v1/a.rb"), "generated BUG\n".to_string())
            .unwrap();

        let rule = PatchRule::replace_all("fix", ["lib/v1/../v1/a.rb"], "BUG", "FIXED").unwrap();
        let outcomes = rule.apply(&mut stage).unwrap();

        assert!(matches!(
            outcomes.as_slice(),
            [FileOutcome::Patched { replacements: 1, .. }]
        ));
        let committed = stage.commit().unwrap();
        assert_eq!(committed, vec![PathBuf::from("lib/v1/a.rb")]);
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("lib/v1/a.rb")).unwrap(),
            "generated FIXED\n"
        );
    }

    #[test]
    fn test_invalid_pattern() {
        let result = PatchRule::replace_all("bad", ["a.rb"], "(unclosed", "x");
        assert!(result.is_err());
    }
}
