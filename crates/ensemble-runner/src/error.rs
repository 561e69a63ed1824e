//! Error types for the ensemble engine.
//!
//! Only genuine failures live here. Expected short-circuits such as an
//! existing variant directory or a sync conflict are reported through
//! [`crate::VariantOutcome`] and never surface as errors.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the ensemble engine.
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("version control error: {0}")]
    VersionControl(#[from] VcsError),

    #[error("external tool error: {0}")]
    ExternalTool(#[from] ExternalToolError),

    #[error("metadata error in {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EnsembleError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Malformed ensemble specification. Fatal before any variant is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Structured-file patch failure. The original file is left untouched.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Failure of a version-control primitive.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("failed to launch git: {0}")]
    Launch(#[source] std::io::Error),

    #[error("`git {args}` failed in {dir}: {stderr}")]
    Command {
        args: String,
        dir: PathBuf,
        stderr: String,
    },

    #[error("{0} is not a git working directory")]
    NotARepository(PathBuf),

    #[error("remote '{remote}' not configured in {dir}")]
    MissingRemote { remote: String, dir: PathBuf },
}

/// Failure of the setup or scheduler collaborator.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}")]
    Failed { command: String, status: String },

    #[error("staging directory {0} was not created")]
    MissingStaging(PathBuf),
}

/// Result type alias for the ensemble engine.
pub type Result<T> = std::result::Result<T, EnsembleError>;
