pub mod loader;
pub mod schema;

pub use loader::{load_from_path, load_from_str, ConfigError, DEFAULT_RULES_FILE};
pub use schema::{
    CopyDefinition, ExpandedCopy, GeneratorConfig, Metadata, OutputDefinition, PatchDefinition,
    SynthConfig, ValidationError, ValidationIssue, VERSION_PLACEHOLDER,
};
