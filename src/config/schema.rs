use crate::copy::is_directory_shaped;
use crate::merge::MergeField;
use crate::patch::ReplaceMode;
use crate::safety::check_relative;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Placeholder substituted with each output's API version.
pub const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SynthConfig {
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
    #[serde(default)]
    pub copies: Vec<CopyDefinition>,
    #[serde(default)]
    pub patches: Vec<PatchDefinition>,
}

impl SynthConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.meta.service.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                rule: None,
                field: "meta.service",
            });
        }

        if let GeneratorConfig::Command { program, .. } = &self.generator {
            if program.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: None,
                    field: "generator.program",
                });
            }
        }

        if self.outputs.is_empty() {
            issues.push(ValidationIssue::EmptyOutputList);
        }

        let mut versions = HashSet::new();
        for output in &self.outputs {
            if output.version.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: None,
                    field: "outputs.version",
                });
            } else if !versions.insert(output.version.as_str()) {
                issues.push(ValidationIssue::InvalidCombo {
                    rule: Some(format!("output {}", output.version)),
                    message: "API version listed more than once".to_string(),
                });
            }
        }

        for copy in &self.copies {
            let rule = Some(format!("copy {}", copy.source));
            if copy.source.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: None,
                    field: "copies.source",
                });
                continue;
            }
            if copy.dest.as_deref().is_some_and(|d| d.trim().is_empty()) {
                issues.push(ValidationIssue::MissingField {
                    rule: rule.clone(),
                    field: "dest",
                });
            }

            for version in &copy.versions {
                if !versions.contains(version.as_str()) {
                    issues.push(ValidationIssue::InvalidCombo {
                        rule: rule.clone(),
                        message: format!("unknown output version '{version}'"),
                    });
                }
            }

            if !copy.merge.is_empty() && is_directory_shaped(&copy.source) {
                issues.push(ValidationIssue::AmbiguousMergeSource {
                    source: copy.source.clone(),
                });
            }

            for path in std::iter::once(&copy.source).chain(copy.dest.iter()) {
                if let Err(e) = check_relative(path) {
                    issues.push(ValidationIssue::UnsafePath {
                        rule: rule.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut ids = HashSet::new();
        for patch in &self.patches {
            if patch.id.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: None,
                    field: "patches.id",
                });
            } else if !ids.insert(patch.id.as_str()) {
                issues.push(ValidationIssue::InvalidCombo {
                    rule: Some(patch.id.clone()),
                    message: "duplicate patch id".to_string(),
                });
            }

            let rule = Some(patch.id.clone());
            if patch.files.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: rule.clone(),
                    field: "files",
                });
            }
            if patch.pattern.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: rule.clone(),
                    field: "pattern",
                });
            }

            for file in &patch.files {
                if file.trim().is_empty() {
                    issues.push(ValidationIssue::MissingField {
                        rule: rule.clone(),
                        field: "files",
                    });
                } else if let Err(e) = check_relative(file) {
                    issues.push(ValidationIssue::UnsafePath {
                        rule: rule.clone(),
                        message: e.to_string(),
                    });
                }
            }

            if !patch.per_version && patch.files.iter().any(|f| f.contains(VERSION_PLACEHOLDER)) {
                issues.push(ValidationIssue::InvalidCombo {
                    rule: rule.clone(),
                    message: format!("files use {VERSION_PLACEHOLDER} but per_version is not set"),
                });
            }

            // Probe with a real version so `{version}` never reaches the regex
            // parser as a repetition.
            let probe = self
                .outputs
                .first()
                .map(|o| o.version.as_str())
                .unwrap_or("v1");
            let pattern = if patch.per_version {
                patch.pattern.replace(VERSION_PLACEHOLDER, probe)
            } else {
                patch.pattern.clone()
            };
            if !pattern.is_empty() {
                if let Err(e) = regex::Regex::new(&pattern) {
                    issues.push(ValidationIssue::InvalidPattern {
                        rule: patch.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Copy rules for one output, in declaration order, with `{version}`
    /// substituted.
    pub fn copies_for(&self, version: &str) -> Vec<ExpandedCopy> {
        self.copies
            .iter()
            .filter(|copy| copy.applies_to(version))
            .map(|copy| {
                let source = copy.source.replace(VERSION_PLACEHOLDER, version);
                let dest = copy
                    .dest
                    .as_deref()
                    .map(|d| d.replace(VERSION_PLACEHOLDER, version))
                    .unwrap_or_else(|| source.clone());
                ExpandedCopy {
                    source,
                    dest,
                    merge: copy.merge.clone(),
                }
            })
            .collect()
    }

    /// Patch rules in execution order.
    ///
    /// A `per_version` patch expands in place into one patch per output, in
    /// output order, with the version appended to its id.
    pub fn expanded_patches(&self) -> Vec<PatchDefinition> {
        let mut expanded = Vec::with_capacity(self.patches.len());
        for patch in &self.patches {
            if !patch.per_version {
                expanded.push(patch.clone());
                continue;
            }
            for output in &self.outputs {
                let version = output.version.as_str();
                expanded.push(PatchDefinition {
                    id: format!("{}[{}]", patch.id, version),
                    files: patch
                        .files
                        .iter()
                        .map(|f| f.replace(VERSION_PLACEHOLDER, version))
                        .collect(),
                    pattern: patch.pattern.replace(VERSION_PLACEHOLDER, version),
                    replacement: patch.replacement.replace(VERSION_PLACEHOLDER, version),
                    mode: patch.mode,
                    per_version: false,
                });
            }
        }
        expanded
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GeneratorConfig {
    /// Outputs were generated ahead of time under `root`
    Directory {
        #[serde(default = "default_root")]
        root: String,
        #[serde(default = "default_layout")]
        layout: String,
    },
    /// Run an external program per output
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig::Directory {
            root: default_root(),
            layout: default_layout(),
        }
    }
}

fn default_root() -> String {
    ".".to_string()
}

fn default_layout() -> String {
    crate::generator::DirectoryGenerator::DEFAULT_LAYOUT.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputDefinition {
    pub version: String,
    /// Output naming hint handed to the generator
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CopyDefinition {
    pub source: String,
    #[serde(default)]
    pub dest: Option<String>,
    /// Restrict to these output versions; empty means every output
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub merge: BTreeSet<MergeField>,
}

impl CopyDefinition {
    pub fn applies_to(&self, version: &str) -> bool {
        self.versions.is_empty() || self.versions.iter().any(|v| v == version)
    }
}

/// A copy rule after `{version}` substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedCopy {
    pub source: String,
    pub dest: String,
    pub merge: BTreeSet<MergeField>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Serialize)]
pub struct PatchDefinition {
    pub id: String,
    pub files: Vec<String>,
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub mode: ReplaceMode,
    #[serde(default)]
    pub per_version: bool,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    EmptyOutputList,
    MissingField {
        rule: Option<String>,
        field: &'static str,
    },
    InvalidCombo {
        rule: Option<String>,
        message: String,
    },
    AmbiguousMergeSource {
        source: String,
    },
    UnsafePath {
        rule: Option<String>,
        message: String,
    },
    InvalidPattern {
        rule: String,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyOutputList => write!(f, "rule file declares no outputs"),
            ValidationIssue::MissingField { rule, field } => match rule {
                Some(rule) => write!(f, "rule '{rule}' missing required field '{field}'"),
                None => write!(f, "missing required field '{field}'"),
            },
            ValidationIssue::InvalidCombo { rule, message } => match rule {
                Some(rule) => write!(f, "rule '{rule}' has invalid configuration: {message}"),
                None => write!(f, "invalid configuration: {message}"),
            },
            ValidationIssue::AmbiguousMergeSource { source } => write!(
                f,
                "merge copy source '{source}' must name exactly one file"
            ),
            ValidationIssue::UnsafePath { rule, message } => match rule {
                Some(rule) => write!(f, "rule '{rule}' has unsafe path: {message}"),
                None => write!(f, "unsafe path: {message}"),
            },
            ValidationIssue::InvalidPattern { rule, message } => {
                write!(f, "patch '{rule}' has invalid pattern: {message}")
            }
        }
    }
}
