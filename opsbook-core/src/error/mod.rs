use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unable to auto-detect book format (neither valid JSON nor valid YAML)")]
    UnknownFormat,
    #[error("failed to read book {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Construction-fatal configuration problems: a malformed step or runner
/// declaration never produces an operator.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate runner name: {0}")]
    DuplicateRunnerName(String),
    #[error("cannot find runner for step {step}: {key}")]
    UnknownRunnerKey { step: String, key: String },
    #[error("invalid {section} section on step {step}: {reason}")]
    InvalidSection {
        step: String,
        section: &'static str,
        reason: String,
    },
    #[error("invalid declaration for runner {name}: {reason}")]
    InvalidRunnerDecl { name: String, reason: String },
    #[error("invalid book: {0}")]
    InvalidBook(String),
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
}
