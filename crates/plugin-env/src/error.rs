//! Error types for plugin-env

use crate::handle::{EnvState, InstallStep};
use thiserror::Error;

/// Errors that can occur while provisioning or tearing down an environment
#[derive(Error, Debug)]
pub enum EnvError {
    /// A lifecycle transition that the state machine does not allow
    #[error("Invalid environment transition for {env}: {from} -> {to}")]
    InvalidTransition {
        env: String,
        from: EnvState,
        to: EnvState,
    },

    /// An install step exited non-zero (or timed out)
    #[error("Dependency install failed for {env} at step {step} (exit code {exit_code}): {detail}")]
    DependencyInstallFailed {
        env: String,
        step: InstallStep,
        exit_code: i32,
        detail: String,
    },

    /// Environment creation or cloning failed
    #[error("Environment creation failed for {env}: {detail}")]
    CreationFailed { env: String, detail: String },

    /// Environment spec file rejected before installation
    #[error("Invalid environment spec {path}: {reason}")]
    InvalidEnvironmentSpec { path: String, reason: String },

    /// Teardown could not release the environment
    #[error("Environment teardown failed for {env}: {detail}")]
    TeardownFailed { env: String, detail: String },

    /// A command template was empty or malformed
    #[error("Invalid command template for {0}")]
    InvalidTemplate(String),

    /// No base environment has been prepared
    #[error("Base environment is not ready")]
    BaseNotReady,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EnvError {
    /// The install step a failure is attributed to, if any.
    pub fn failed_step(&self) -> Option<InstallStep> {
        match self {
            EnvError::DependencyInstallFailed { step, .. } => Some(*step),
            _ => None,
        }
    }
}
