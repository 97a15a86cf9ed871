//! Synth Patcher: post-generation synthesis for generated API client libraries
//!
//! Takes the trees an external client generator produces, copies a chosen
//! subset into a destination library, and applies declarative regex patches
//! that correct known generator defects without touching the generator.
//!
//! # Architecture
//!
//! A rule file compiles into a [`Pipeline`]: one [`OutputPlan`] of
//! [`CopyRule`]s per generator output, followed by a global list of
//! [`PatchRule`]s. The driver runs every copy phase, then every patch, all
//! against a [`Stage`] overlay of the destination.
//!
//! # Safety
//!
//! - Nothing is written until every rule has succeeded
//! - Atomic file writes (tempfile + fsync + rename)
//! - Files changed on disk during a run abort the commit
//! - Rule paths cannot leave their root
//! - Patches that match nothing are a no-op, so reruns are safe
//!
//! # Example
//!
//! ```no_run
//! use synth_patcher::{DirectoryGenerator, Pipeline, RunOptions};
//! use std::path::Path;
//!
//! let config = synth_patcher::load_from_path("synth.toml")?;
//! let pipeline = Pipeline::from_config(&config)?;
//! let generator = DirectoryGenerator::new("genfiles", "{version}/{output}");
//!
//! let report = pipeline.run(&generator, Path::new("."), RunOptions::default())?;
//! println!("{} files changed", report.changes.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod copy;
pub mod generator;
pub mod merge;
pub mod patch;
pub mod pipeline;
pub mod safety;
pub mod stage;

// Re-exports
pub use config::{load_from_path, load_from_str, ConfigError, SynthConfig, ValidationError};
pub use copy::{CopyRule, CopyRuleError};
pub use generator::{
    CommandGenerator, DirectoryGenerator, Generator, GeneratorError, GeneratorOutput,
    GeneratorRequest,
};
pub use merge::{FieldMerge, MergeField, Merged};
pub use patch::{PatchRule, ReplaceMode};
pub use pipeline::{
    FileChange, FileOutcome, OutputPlan, Phase, Pipeline, PipelineError, RuleReport, RunOptions,
    RunReport,
};
pub use safety::{PathGuard, SafetyError};
pub use stage::{Stage, StageError, WriteOutcome};
