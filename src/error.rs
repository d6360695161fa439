use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("unknown build: {0}")]
    UnknownBuild(String),

    #[error("build references unregistered source: {0}")]
    UnknownSource(String),

    #[error("unknown identifier scheme: {0}")]
    UnknownScheme(String),

    #[error("source {source_name}: no translation path from scheme {scheme} to any of [{outputs}]")]
    #[diagnostic(help("register a mapper or lookup edge leading to the canonical scheme"))]
    IncompleteTranslationPath {
        source_name: String,
        scheme: String,
        outputs: String,
    },

    #[error("invalid build configuration: {0}")]
    InvalidBuildConfig(String),

    #[error("missing config file kira-genedoc.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to load mapping table for mapper {mapper}: {reason}")]
    MappingLoad { mapper: String, reason: String },

    #[error("translation graph walk from scheme {scheme} exceeded {hops} hops")]
    #[diagnostic(help("the translation graph contains a cycle of successful lookups"))]
    GraphCycle { scheme: String, hops: usize },

    #[error("failed to read source {source_name}: {reason}")]
    SourceRead { source_name: String, reason: String },

    #[error("target collection already exists: {0}")]
    TargetExists(String),

    #[error("target collection not found: {0}")]
    TargetNotFound(String),

    #[error("failed to write target {target}: {reason}")]
    TargetWrite { target: String, reason: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    /// Errors raised while validating a build before any source is read.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            KiraError::UnknownBuild(_)
                | KiraError::UnknownSource(_)
                | KiraError::UnknownScheme(_)
                | KiraError::IncompleteTranslationPath { .. }
                | KiraError::InvalidBuildConfig(_)
                | KiraError::MissingConfig
                | KiraError::ConfigRead(_)
                | KiraError::ConfigParse(_)
                | KiraError::TargetExists(_)
                | KiraError::TargetNotFound(_)
                | KiraError::GraphCycle { .. }
        )
    }
}

/// A single malformed raw record. Counted and logged by the builder, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_name}{}: {reason}", line_suffix(.line))]
pub struct RecordError {
    pub source_name: String,
    pub line: Option<usize>,
    pub reason: String,
}

impl RecordError {
    pub fn new(
        source_name: impl Into<String>,
        line: Option<usize>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            line,
            reason: reason.into(),
        }
    }
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|line| format!(" line {line}")).unwrap_or_default()
}
