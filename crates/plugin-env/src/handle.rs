//! Environment handles and their lifecycle state machine
//!
//! A handle is created by a provisioner, moves through
//! `Created -> DependenciesInstalling -> Ready -> InUse -> TornDown`
//! and is owned by exactly one run at a time.

use crate::error::EnvError;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Lifecycle state of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    Created,
    DependenciesInstalling,
    Ready,
    InUse,
    Failed,
    TornDown,
}

impl EnvState {
    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: EnvState) -> bool {
        use EnvState::*;
        match (self, to) {
            (Created, DependenciesInstalling) => true,
            (DependenciesInstalling, Ready) | (DependenciesInstalling, Failed) => true,
            (Ready, InUse) => true,
            // Teardown is reachable from every live state
            (TornDown, _) => false,
            (_, TornDown) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnvState::Created => "created",
            EnvState::DependenciesInstalling => "dependencies_installing",
            EnvState::Ready => "ready",
            EnvState::InUse => "in_use",
            EnvState::Failed => "failed",
            EnvState::TornDown => "torn_down",
        };
        f.write_str(name)
    }
}

/// One step of dependency installation, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    /// The host library in editable/importable form
    HostLibrary,
    /// A plugin's environment spec (e.g. environment.yml)
    EnvironmentSpec,
    /// A plugin's plain requirements list (e.g. requirements.txt)
    Requirements,
}

impl InstallStep {
    pub fn name(&self) -> &'static str {
        match self {
            InstallStep::HostLibrary => "host_library",
            InstallStep::EnvironmentSpec => "environment_spec",
            InstallStep::Requirements => "requirements",
        }
    }
}

impl std::fmt::Display for InstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A component installed into an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledComponent {
    pub step: InstallStep,
    pub source: PathBuf,
}

/// What to install into a new environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Environment name, unique per run (e.g. `models__alexnet`)
    pub name: String,
    /// Root of the host library checkout
    pub host_library: PathBuf,
    /// Environment spec files, installed after the host library
    pub environment_specs: Vec<PathBuf>,
    /// Requirements lists, installed last
    pub requirements: Vec<PathBuf>,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>, host_library: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            host_library: host_library.into(),
            environment_specs: Vec::new(),
            requirements: Vec::new(),
        }
    }

    pub fn with_environment_spec(mut self, path: impl Into<PathBuf>) -> Self {
        self.environment_specs.push(path.into());
        self
    }

    pub fn with_requirements(mut self, path: impl Into<PathBuf>) -> Self {
        self.requirements.push(path.into());
        self
    }

    /// Ordered install plan: host library, environment specs, requirements.
    ///
    /// Later steps may shadow versions pinned by earlier ones.
    pub fn install_plan(&self) -> Vec<(InstallStep, PathBuf)> {
        let mut plan = vec![(InstallStep::HostLibrary, self.host_library.clone())];
        plan.extend(
            self.environment_specs
                .iter()
                .map(|p| (InstallStep::EnvironmentSpec, p.clone())),
        );
        plan.extend(
            self.requirements
                .iter()
                .map(|p| (InstallStep::Requirements, p.clone())),
        );
        plan
    }

    /// The plugin-specific part of the plan (everything after the host library).
    pub fn plugin_steps(&self) -> Vec<(InstallStep, PathBuf)> {
        self.install_plan().into_iter().skip(1).collect()
    }
}

/// Opaque handle to a provisioned environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    id: Uuid,
    name: String,
    root: PathBuf,
    state: EnvState,
    cloned_from: Option<String>,
    installed: Vec<InstalledComponent>,
}

impl EnvironmentHandle {
    /// Create a handle in the `Created` state
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            root: root.into(),
            state: EnvState::Created,
            cloned_from: None,
            installed: Vec::new(),
        }
    }

    /// Create a handle that starts with the exact components of `base`
    pub fn cloned(base: &EnvironmentHandle, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mut handle = Self::new(name, root);
        handle.cloned_from = Some(base.name.clone());
        handle.installed = base.installed.clone();
        handle
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn cloned_from(&self) -> Option<&str> {
        self.cloned_from.as_deref()
    }

    pub fn installed(&self) -> &[InstalledComponent] {
        &self.installed
    }

    /// Whether the host library is already part of this environment
    pub fn has_host_library(&self) -> bool {
        self.installed
            .iter()
            .any(|c| c.step == InstallStep::HostLibrary)
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, to: EnvState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(EnvError::InvalidTransition {
                env: self.name.clone(),
                from: self.state,
                to,
            });
        }
        debug!(env = %self.name, from = %self.state, to = %to, "Environment transition");
        self.state = to;
        Ok(())
    }

    /// Record a successful install step
    pub fn record_install(&mut self, step: InstallStep, source: impl Into<PathBuf>) {
        self.installed.push(InstalledComponent {
            step,
            source: source.into(),
        });
    }

    /// Mark the environment as in use by a test run
    pub fn acquire(&mut self) -> Result<()> {
        self.transition(EnvState::InUse)
    }

    /// SHA-256 over the ordered installed components.
    ///
    /// Two environments with the same digest carry the same package set.
    pub fn component_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for component in &self.installed {
            hasher.update(component.step.name().as_bytes());
            hasher.update(b"\0");
            hasher.update(component.source.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    /// Short id (first 8 characters)
    pub fn short_id(&self) -> String {
        self.id.to_string().chars().take(8).collect()
    }
}
