//! Plugin-Env: isolated dependency environments for plugin test runs
//!
//! This crate provides the environment layer of plugin-ci. Every affected
//! plugin gets its own environment: the host library installed in editable
//! form, then the plugin's environment spec, then its requirements list.
//!
//! ## Lifecycle
//!
//! `Created -> DependenciesInstalling -> Ready -> InUse -> TornDown`, with
//! `DependenciesInstalling -> Failed` when an install step fails.
//!
//! ## Backends
//!
//! - [`CommandProvisioner`]: drives conda, venv or any other package manager
//!   through a [`ToolchainProfile`] of command templates.
//! - [`SimulatedProvisioner`]: in-memory package sets, for tests.

pub mod command;
pub mod error;
pub mod handle;
pub mod manifest;
pub mod process;
pub mod provisioner;
pub mod simulated;

pub use command::{CommandProvisioner, ToolchainProfile, BASE_ENV_NAME};
pub use error::EnvError;
pub use handle::{EnvState, EnvironmentHandle, InstallStep, InstalledComponent, ProvisionRequest};
pub use manifest::{
    load_environment_spec, load_requirements, EnvironmentSpec, DEFAULT_PYTHON_SERIES,
    ENVIRONMENT_SPEC_FILE, REQUIREMENTS_FILE,
};
pub use process::{run_bounded, ProcessOutput, SIGNAL_EXIT_CODE, TIMEOUT_EXIT_CODE};
pub use provisioner::EnvironmentProvisioner;
pub use simulated::SimulatedProvisioner;

/// Result type for environment operations
pub type Result<T> = std::result::Result<T, EnvError>;
