//! Pipeline driver - runs copy phases then patch phases against a staged tree
//!
//! A synthesis run:
//! - Produces each generator output in declared order (stable before beta)
//! - Runs that output's full copy list before moving on
//! - Runs the global patch list once every output is copied
//! - Commits the staged tree only if every rule succeeded

use crate::config::{ExpandedCopy, SynthConfig};
use crate::copy::{CopyRule, CopyRuleError};
use crate::generator::{Generator, GeneratorError, GeneratorRequest};
use crate::merge::{FieldMerge, MergeField};
use crate::patch::PatchRule;
use crate::safety::SafetyError;
use crate::stage::{Stage, StageError};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, info_span};

/// Outcome of one rule on one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    /// File was copied and its content changed
    Copied { file: PathBuf },
    /// File was copied through a merge; `preserved` fields came from the
    /// existing destination file
    Merged {
        file: PathBuf,
        preserved: Vec<MergeField>,
    },
    /// Pattern matched and the file changed
    Patched { file: PathBuf, replacements: usize },
    /// Rule ran but the content was already what it would write
    Unchanged { file: PathBuf },
    /// Pattern matched nothing in this file
    NoMatch { file: PathBuf },
}

impl FileOutcome {
    pub fn file(&self) -> &Path {
        match self {
            FileOutcome::Copied { file }
            | FileOutcome::Merged { file, .. }
            | FileOutcome::Patched { file, .. }
            | FileOutcome::Unchanged { file }
            | FileOutcome::NoMatch { file } => file,
        }
    }

    /// Whether the rule changed this file.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            FileOutcome::Copied { .. } | FileOutcome::Merged { .. } | FileOutcome::Patched { .. }
        )
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOutcome::Copied { file } => write!(f, "Copied {}", file.display()),
            FileOutcome::Merged { file, preserved } if preserved.is_empty() => {
                write!(f, "Merged {} (generator defaults)", file.display())
            }
            FileOutcome::Merged { file, preserved } => {
                let fields: Vec<&str> = preserved.iter().map(|p| p.as_str()).collect();
                write!(
                    f,
                    "Merged {} (kept {})",
                    file.display(),
                    fields.join(", ")
                )
            }
            FileOutcome::Patched { file, replacements } => {
                write!(f, "Patched {} ({} replacements)", file.display(), replacements)
            }
            FileOutcome::Unchanged { file } => write!(f, "Unchanged {}", file.display()),
            FileOutcome::NoMatch { file } => write!(f, "No match in {}", file.display()),
        }
    }
}

/// Errors that abort a synthesis run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("generator failed for {service} {version}: {source}")]
    Generator {
        service: String,
        version: String,
        source: GeneratorError,
    },

    #[error("{rule}: {} does not exist{}", .path.display(), format_suggestions(.suggestions))]
    MissingTargetFile {
        rule: String,
        path: PathBuf,
        suggestions: Vec<String>,
    },

    #[error("{rule}: merge source {} resolves to more than one file", .path.display())]
    AmbiguousMergeSource { rule: String, path: PathBuf },

    #[error("{rule}: invalid pattern: {source}")]
    InvalidPattern { rule: String, source: regex::Error },

    #[error("{rule}: I/O error on {}: {source}", .path.display())]
    Io {
        rule: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{rule}: {source}")]
    Stage { rule: String, source: StageError },

    #[error("{rule}: {source}")]
    Safety { rule: String, source: SafetyError },

    #[error("{rule}: {source}")]
    Rule { rule: String, source: CopyRuleError },

    #[error("commit failed: {0}")]
    Commit(#[source] StageError),
}

impl PipelineError {
    pub(crate) fn io(rule: String, path: PathBuf, source: std::io::Error) -> Self {
        PipelineError::Io { rule, path, source }
    }

    /// Lift a stage error, keeping missing-file and safety failures distinct.
    pub(crate) fn stage(rule: String, source: StageError) -> Self {
        match source {
            StageError::Safety(source) => PipelineError::Safety { rule, source },
            source => PipelineError::Stage { rule, source },
        }
    }

    pub(crate) fn safety(rule: String, source: SafetyError) -> Self {
        PipelineError::Safety { rule, source }
    }

    /// Whether the destination is guaranteed unchanged after this error.
    ///
    /// Everything before commit only touches the stage, and a concurrent
    /// modification is detected before the first write. Any other commit
    /// failure happens between writes.
    pub fn destination_untouched(&self) -> bool {
        match self {
            PipelineError::Commit(StageError::Modified(_)) => true,
            PipelineError::Commit(_) => false,
            _ => true,
        }
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean {}?)", suggestions.join(", "))
    }
}

/// Driver state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Copying,
    Patching,
    Done,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Copying => Phase::Patching,
            Phase::Patching | Phase::Done => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Copying => f.write_str("copying"),
            Phase::Patching => f.write_str("patching"),
            Phase::Done => f.write_str("done"),
        }
    }
}

/// Copy phase for one generator output.
#[derive(Debug, Clone)]
pub struct OutputPlan {
    pub service: String,
    pub version: String,
    pub output: String,
    pub copies: Vec<CopyRule>,
}

impl OutputPlan {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            output: output.into(),
            copies: Vec::new(),
        }
    }

    pub fn copy(mut self, rule: CopyRule) -> Self {
        self.copies.push(rule);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stage everything but commit nothing
    pub dry_run: bool,
}

/// Report for one executed rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    pub phase: Phase,
    pub rule: String,
    pub outcomes: Vec<FileOutcome>,
}

/// A file the run changed (or would change, in a dry run)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub before: Option<String>,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[must_use = "RunReport should be inspected or reported"]
pub struct RunReport {
    pub rules: Vec<RuleReport>,
    pub changes: Vec<FileChange>,
    pub committed: bool,
}

impl RunReport {
    /// Rules that changed at least one file.
    pub fn changed_rules(&self) -> impl Iterator<Item = &RuleReport> {
        self.rules
            .iter()
            .filter(|r| r.outcomes.iter().any(FileOutcome::is_change))
    }
}

/// An ordered list of copy phases followed by a patch phase.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    outputs: Vec<OutputPlan>,
    patches: Vec<PatchRule>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, plan: OutputPlan) -> Self {
        self.outputs.push(plan);
        self
    }

    pub fn patch(mut self, rule: PatchRule) -> Self {
        self.patches.push(rule);
        self
    }

    pub fn outputs(&self) -> &[OutputPlan] {
        &self.outputs
    }

    pub fn patches(&self) -> &[PatchRule] {
        &self.patches
    }

    /// Build the rule list a validated config describes.
    pub fn from_config(config: &SynthConfig) -> Result<Self, PipelineError> {
        let mut pipeline = Pipeline::new();

        for output in &config.outputs {
            let mut plan = OutputPlan::new(&config.meta.service, &output.version, &output.output);
            for copy in config.copies_for(&output.version) {
                plan = plan.copy(copy_rule(copy)?);
            }
            pipeline = pipeline.output(plan);
        }

        for patch in config.expanded_patches() {
            let rule = PatchRule::new(
                &patch.id,
                patch.files.iter().map(PathBuf::from),
                &patch.pattern,
                patch.replacement.clone(),
                patch.mode,
            )
            .map_err(|source| PipelineError::InvalidPattern {
                rule: patch.id.clone(),
                source,
            })?;
            pipeline = pipeline.patch(rule);
        }

        Ok(pipeline)
    }

    /// Execute every rule into `stage` without committing.
    pub fn execute(
        &self,
        generator: &dyn Generator,
        stage: &mut Stage,
    ) -> Result<Vec<RuleReport>, PipelineError> {
        let mut reports = Vec::new();
        let mut phase = Phase::Copying;
        info!(%phase, outputs = self.outputs.len(), "starting synthesis");

        for plan in &self.outputs {
            let _span = info_span!("output", version = %plan.version).entered();
            let request = GeneratorRequest {
                service: &plan.service,
                version: &plan.version,
                output: &plan.output,
            };
            let output = generator
                .produce(&request)
                .map_err(|source| PipelineError::Generator {
                    service: plan.service.clone(),
                    version: plan.version.clone(),
                    source,
                })?;

            for rule in &plan.copies {
                debug!(rule = %rule.describe(), "copy");
                let outcomes = rule.apply(&output, stage)?;
                reports.push(RuleReport {
                    phase,
                    rule: rule.describe(),
                    outcomes,
                });
            }
        }

        phase = phase.next();
        info!(%phase, patches = self.patches.len(), "copy phase complete");

        for rule in &self.patches {
            let _span = info_span!("patch", id = rule.id()).entered();
            let outcomes = rule.apply(stage)?;
            reports.push(RuleReport {
                phase,
                rule: rule.describe(),
                outcomes,
            });
        }

        phase = phase.next();
        info!(%phase, "patch phase complete");

        Ok(reports)
    }

    /// Run the whole pipeline against `dest`.
    ///
    /// Either every rule succeeds and the staged tree is committed, or the
    /// first failure is returned and `dest` is left untouched.
    pub fn run(
        &self,
        generator: &dyn Generator,
        dest: &Path,
        options: RunOptions,
    ) -> Result<RunReport, PipelineError> {
        let mut stage = Stage::new(dest);
        let rules = self.execute(generator, &mut stage)?;

        let changes: Vec<FileChange> = stage
            .changes()
            .into_iter()
            .map(|c| FileChange {
                path: c.path.to_path_buf(),
                before: c.before.map(str::to_string),
                after: c.after.to_string(),
            })
            .collect();

        if options.dry_run {
            info!(files = changes.len(), "dry run, nothing committed");
            return Ok(RunReport {
                rules,
                changes,
                committed: false,
            });
        }

        let committed = stage.commit().map_err(PipelineError::Commit)?;
        info!(files = committed.len(), "committed");

        Ok(RunReport {
            rules,
            changes,
            committed: true,
        })
    }
}

fn copy_rule(copy: ExpandedCopy) -> Result<CopyRule, PipelineError> {
    if copy.merge.is_empty() {
        return Ok(CopyRule::new(copy.source, copy.dest));
    }
    let describe = format!("copy {} -> {}", copy.source, copy.dest);
    CopyRule::with_merge(copy.source, copy.dest, FieldMerge::new(copy.merge)).map_err(|source| {
        PipelineError::Rule {
            rule: describe,
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_only_moves_forward() {
        assert_eq!(Phase::Copying.next(), Phase::Patching);
        assert_eq!(Phase::Patching.next(), Phase::Done);
        assert_eq!(Phase::Done.next(), Phase::Done);
    }

    #[test]
    fn test_destination_untouched_only_before_writes() {
        let missing = PipelineError::MissingTargetFile {
            rule: "patch 'x'".to_string(),
            path: PathBuf::from("Rakefile"),
            suggestions: vec![],
        };
        assert!(missing.destination_untouched());

        let modified = PipelineError::Commit(StageError::Modified(PathBuf::from("Rakefile")));
        assert!(modified.destination_untouched());

        let io = PipelineError::Commit(StageError::Io {
            path: PathBuf::from("lib/a.rb"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        assert!(!io.destination_untouched());
    }

    #[test]
    fn test_missing_file_message_lists_suggestions() {
        let err = PipelineError::MissingTargetFile {
            rule: "patch 'x'".to_string(),
            path: PathBuf::from("lib/credential.rb"),
            suggestions: vec!["lib/credentials.rb".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("lib/credential.rb does not exist"));
        assert!(message.contains("did you mean lib/credentials.rb?"));
    }

    #[test]
    fn test_file_outcome_display() {
        let merged = FileOutcome::Merged {
            file: PathBuf::from("a.gemspec"),
            preserved: vec![MergeField::Version],
        };
        assert_eq!(merged.to_string(), "Merged a.gemspec (kept version)");

        let patched = FileOutcome::Patched {
            file: PathBuf::from("Rakefile"),
            replacements: 1,
        };
        assert!(patched.is_change());
        assert!(!FileOutcome::NoMatch {
            file: PathBuf::from("Rakefile")
        }
        .is_change());
    }
}
