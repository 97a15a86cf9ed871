//! Generator adapters.
//!
//! A [`Generator`] turns a (service, API version, output name) request into a
//! [`GeneratorOutput`]: a read-only file tree the copy phase pulls from. The
//! pipeline does not care how the tree came to be; it only addresses paths
//! inside it.

use crate::config::GeneratorConfig;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("generator output not found at {0}")]
    MissingOutput(PathBuf),

    #[error("failed to launch generator '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("generator '{program}' exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to prepare generator scratch directory: {0}")]
    Scratch(std::io::Error),
}

/// What to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorRequest<'a> {
    /// Service name, e.g. `language`
    pub service: &'a str,
    /// API version, e.g. `v1beta2`
    pub version: &'a str,
    /// Output naming hint, e.g. `google-cloud-ruby/google-cloud-language`
    pub output: &'a str,
}

impl GeneratorRequest<'_> {
    fn expand(&self, template: &str, out_dir: Option<&Path>) -> String {
        let mut expanded = template
            .replace("{service}", self.service)
            .replace("{version}", self.version)
            .replace("{output}", self.output);
        if let Some(dir) = out_dir {
            expanded = expanded.replace("{out_dir}", &dir.display().to_string());
        }
        expanded
    }
}

/// A generated tree for one API version.
///
/// Outputs produced into a scratch directory own it; the directory is removed
/// when the output is dropped.
#[derive(Debug)]
pub struct GeneratorOutput {
    service: String,
    version: String,
    root: PathBuf,
    _scratch: Option<TempDir>,
}

impl GeneratorOutput {
    /// Wrap an existing directory.
    pub fn new(service: impl Into<String>, version: impl Into<String>, root: PathBuf) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            root,
            _scratch: None,
        }
    }

    fn with_scratch(mut self, scratch: TempDir) -> Self {
        self._scratch = Some(scratch);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `rel` inside this tree.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }
}

/// Produces generator outputs on demand.
pub trait Generator {
    fn produce(&self, request: &GeneratorRequest<'_>) -> Result<GeneratorOutput, GeneratorError>;
}

/// Reads outputs that were generated ahead of time.
///
/// Each output lives at `root/<layout>`, where the layout may reference
/// `{service}`, `{version}` and `{output}`.
#[derive(Debug, Clone)]
pub struct DirectoryGenerator {
    root: PathBuf,
    layout: String,
}

impl DirectoryGenerator {
    pub const DEFAULT_LAYOUT: &'static str = "{version}/{output}";

    pub fn new(root: impl Into<PathBuf>, layout: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            layout: layout.into(),
        }
    }
}

impl Generator for DirectoryGenerator {
    fn produce(&self, request: &GeneratorRequest<'_>) -> Result<GeneratorOutput, GeneratorError> {
        let dir = self.root.join(request.expand(&self.layout, None));
        if !dir.is_dir() {
            return Err(GeneratorError::MissingOutput(dir));
        }
        debug!(path = %dir.display(), version = request.version, "using pre-generated output");
        Ok(GeneratorOutput::new(request.service, request.version, dir))
    }
}

/// Runs an external generator into a fresh scratch directory.
///
/// Arguments may reference `{service}`, `{version}`, `{output}` and
/// `{out_dir}`. The generated tree is expected at `{out_dir}/{output}`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl Generator for CommandGenerator {
    fn produce(&self, request: &GeneratorRequest<'_>) -> Result<GeneratorOutput, GeneratorError> {
        let scratch = tempfile::tempdir().map_err(GeneratorError::Scratch)?;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| request.expand(arg, Some(scratch.path())))
            .collect();

        info!(
            program = %self.program,
            service = request.service,
            version = request.version,
            "running generator"
        );

        let mut command = Command::new(&self.program);
        command.args(&args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = command.output().map_err(|source| GeneratorError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(GeneratorError::Exited {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let root = scratch.path().join(request.output);
        if !root.is_dir() {
            return Err(GeneratorError::MissingOutput(root));
        }

        Ok(GeneratorOutput::new(request.service, request.version, root).with_scratch(scratch))
    }
}

/// Build the generator a rule file asks for.
///
/// Relative directories resolve against `base`, normally the directory that
/// holds the rule file.
pub fn from_config(config: &GeneratorConfig, base: &Path) -> Box<dyn Generator> {
    match config {
        GeneratorConfig::Directory { root, layout } => {
            Box::new(DirectoryGenerator::new(base.join(root), layout.clone()))
        }
        GeneratorConfig::Command { program, args } => {
            Box::new(CommandGenerator::new(program.clone(), args.clone()).working_dir(base))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request<'a>(version: &'a str) -> GeneratorRequest<'a> {
        GeneratorRequest {
            service: "language",
            version,
            output: "google-cloud-language",
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let req = request("v1beta2");
        let expanded = req.expand("{service}/{version}/{output}", None);
        assert_eq!(expanded, "language/v1beta2/google-cloud-language");
    }

    #[test]
    fn test_directory_generator_resolves_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tree = temp_dir.path().join("v1/google-cloud-language");
        fs::create_dir_all(&tree).unwrap();

        let generator = DirectoryGenerator::new(temp_dir.path(), DirectoryGenerator::DEFAULT_LAYOUT);
        let output = generator.produce(&request("v1")).unwrap();

        assert_eq!(output.root(), tree);
        assert_eq!(output.version(), "v1");
        assert_eq!(output.path("Rakefile"), tree.join("Rakefile"));
    }

    #[test]
    fn test_directory_generator_missing_output() {
        let temp_dir = tempfile::tempdir().unwrap();
        let generator = DirectoryGenerator::new(temp_dir.path(), DirectoryGenerator::DEFAULT_LAYOUT);
        let result = generator.produce(&request("v9"));
        assert!(matches!(result, Err(GeneratorError::MissingOutput(_))));
    }

    #[test]
    fn test_command_generator_spawn_failure() {
        let generator = CommandGenerator::new("synth-patcher-no-such-generator", vec![]);
        let result = generator.produce(&request("v1"));
        assert!(matches!(result, Err(GeneratorError::Spawn { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn test_command_generator_produces_scratch_tree() {
        let generator = CommandGenerator::new(
            "sh",
            vec![
                "-c".to_string(),
                "mkdir -p \"$0/google-cloud-language\" && echo {version} > \"$0/google-cloud-language/VERSION\"".to_string(),
                "{out_dir}".to_string(),
            ],
        );

        let output = generator.produce(&request("v1")).unwrap();
        let version = fs::read_to_string(output.path("VERSION")).unwrap();
        assert_eq!(version.trim(), "v1");

        let root = output.root().to_path_buf();
        drop(output);
        assert!(!root.exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_command_generator_nonzero_exit() {
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
        );
        let result = generator.produce(&request("v1"));
        match result {
            Err(GeneratorError::Exited { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected Exited, got {other:?}"),
        }
    }
}
