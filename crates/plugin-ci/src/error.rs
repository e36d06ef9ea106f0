//! Error taxonomy for plugin test orchestration

use crate::kind::PluginKind;
use plugin_env::EnvError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CiError {
    #[error("No {kind} plugin directory matches identifier '{identifier}'")]
    PluginNotFound { kind: PluginKind, identifier: String },

    #[error("Identifier '{identifier}' is registered by more than one {kind} plugin: {directories:?}")]
    AmbiguousRegistration {
        kind: PluginKind,
        identifier: String,
        directories: Vec<String>,
    },

    #[error("No test files found for {target}")]
    NoTestsCollected { target: String },

    #[error("Test execution failed for {target}: {detail}")]
    TestExecutionFailed { target: String, detail: String },

    #[error("Environment error: {0}")]
    Environment(#[from] EnvError),

    #[error("Report merge failed: {0}")]
    Report(#[from] ReportError),

    #[error("Scoring failed for {model} on {benchmark}: {detail}")]
    ScoringFailed {
        model: String,
        benchmark: String,
        detail: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures while merging per-target report artifacts.
///
/// Kept separate from [`CiError`] so a merge problem can be logged without
/// ever being confused with a test failure.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report artifact missing: {0}")]
    Missing(String),

    #[error("Report artifact {path} is not a test report: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CI operations
pub type Result<T> = std::result::Result<T, CiError>;
