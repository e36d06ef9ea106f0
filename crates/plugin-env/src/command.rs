//! Provisioner driven by external package-manager command templates
//!
//! A [`ToolchainProfile`] describes how to create, clone, populate and
//! remove an environment as argv templates. Placeholders:
//! - `{env}`  - root directory of the environment being operated on
//! - `{base}` - root directory of the base environment (clone only)
//! - `{path}` - the manifest or library path being installed

use crate::error::EnvError;
use crate::handle::{EnvState, EnvironmentHandle, InstallStep, ProvisionRequest};
use crate::manifest::{load_environment_spec, DEFAULT_PYTHON_SERIES};
use crate::process::{run_bounded, ProcessOutput};
use crate::provisioner::{release_failed, EnvironmentProvisioner};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name given to the shared base environment
pub const BASE_ENV_NAME: &str = "plugin-ci-base";

/// Command templates for one package manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainProfile {
    /// Profile name (e.g. "conda")
    pub name: String,

    /// Create an empty environment at `{env}`
    pub create: Vec<String>,

    /// Clone `{base}` into `{env}`; `None` disables base reuse
    pub clone: Option<Vec<String>>,

    /// Install the host library at `{path}` into `{env}`
    pub install_host: Option<Vec<String>>,

    /// Apply the environment spec at `{path}` to `{env}`
    pub install_environment_spec: Option<Vec<String>>,

    /// Install the requirements list at `{path}` into `{env}`
    pub install_requirements: Option<Vec<String>>,

    /// Remove `{env}`; `None` deletes the directory
    pub remove: Option<Vec<String>>,

    /// Executables directory relative to the environment root
    pub bin_dir: String,

    /// Variable pointing at the active environment root
    pub activation_var: String,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl ToolchainProfile {
    /// conda environments addressed by prefix
    pub fn conda() -> Self {
        Self {
            name: "conda".to_string(),
            create: argv(&["conda", "create", "-y", "-q", "-p", "{env}", "python=3.11"]),
            clone: Some(argv(&["conda", "create", "-y", "-q", "-p", "{env}", "--clone", "{base}"])),
            install_host: Some(argv(&[
                "conda", "run", "-p", "{env}", "python", "-m", "pip", "install", "-q", "-e", "{path}",
            ])),
            install_environment_spec: Some(argv(&[
                "conda", "env", "update", "-q", "-p", "{env}", "--file", "{path}",
            ])),
            install_requirements: Some(argv(&[
                "conda", "run", "-p", "{env}", "python", "-m", "pip", "install", "-q", "-r", "{path}",
            ])),
            remove: Some(argv(&["conda", "env", "remove", "-y", "-q", "-p", "{env}"])),
            bin_dir: "bin".to_string(),
            activation_var: "CONDA_PREFIX".to_string(),
        }
    }

    /// Plain virtualenvs; environment specs are not supported and get skipped
    pub fn venv() -> Self {
        Self {
            name: "venv".to_string(),
            create: argv(&["python3", "-m", "venv", "{env}"]),
            clone: None,
            install_host: Some(argv(&[
                "{env}/bin/python", "-m", "pip", "install", "-q", "-e", "{path}",
            ])),
            install_environment_spec: None,
            install_requirements: Some(argv(&[
                "{env}/bin/python", "-m", "pip", "install", "-q", "-r", "{path}",
            ])),
            remove: None,
            bin_dir: "bin".to_string(),
            activation_var: "VIRTUAL_ENV".to_string(),
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "conda" => Some(Self::conda()),
            "venv" => Some(Self::venv()),
            _ => None,
        }
    }

    fn install_template(&self, step: InstallStep) -> Option<&Vec<String>> {
        match step {
            InstallStep::HostLibrary => self.install_host.as_ref(),
            InstallStep::EnvironmentSpec => self.install_environment_spec.as_ref(),
            InstallStep::Requirements => self.install_requirements.as_ref(),
        }
    }
}

/// Substitute placeholders in a template
pub fn render(template: &[String], env: &Path, base: Option<&Path>, path: Option<&Path>) -> Vec<String> {
    template
        .iter()
        .map(|part| {
            let mut out = part.replace("{env}", &env.to_string_lossy());
            if let Some(base) = base {
                out = out.replace("{base}", &base.to_string_lossy());
            }
            if let Some(path) = path {
                out = out.replace("{path}", &path.to_string_lossy());
            }
            out
        })
        .collect()
}

/// Provisioner that shells out to a package manager
pub struct CommandProvisioner {
    profile: ToolchainProfile,
    envs_dir: PathBuf,
    install_timeout: Option<Duration>,
    python_series: String,
    reuse_base: bool,
    base: Mutex<Option<(PathBuf, EnvironmentHandle)>>,
}

impl CommandProvisioner {
    pub fn new(profile: ToolchainProfile, envs_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile,
            envs_dir: envs_dir.into(),
            install_timeout: None,
            python_series: DEFAULT_PYTHON_SERIES.to_string(),
            reuse_base: false,
            base: Mutex::new(None),
        }
    }

    /// Bound every create/clone/install command by `timeout`
    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = Some(timeout);
        self
    }

    /// Python series environment specs must pin, if they pin one
    pub fn with_python_series(mut self, series: impl Into<String>) -> Self {
        self.python_series = series.into();
        self
    }

    /// Clone a prepared base environment instead of installing from scratch
    pub fn with_base_reuse(mut self, enabled: bool) -> Self {
        self.reuse_base = enabled;
        self
    }

    pub fn profile(&self) -> &ToolchainProfile {
        &self.profile
    }

    fn env_root(&self, name: &str) -> PathBuf {
        self.envs_dir.join(name)
    }

    async fn run_template(&self, label: &str, rendered: Vec<String>) -> Result<ProcessOutput> {
        let (program, args) = rendered
            .split_first()
            .ok_or_else(|| EnvError::InvalidTemplate(label.to_string()))?;
        debug!(command = label, argv = ?rendered, "Running toolchain command");
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(run_bounded(cmd, label, self.install_timeout).await?)
    }

    /// Create (or clone) the environment root. Returns the handle and the
    /// steps still to install.
    async fn create(&self, request: &ProvisionRequest) -> Result<(EnvironmentHandle, Vec<(InstallStep, PathBuf)>)> {
        let root = self.env_root(&request.name);
        if root.exists() {
            warn!(env = %request.name, root = %root.display(), "Removing stale environment");
            std::fs::remove_dir_all(&root)?;
        }

        match self.create_root(request, &root).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!(env = %request.name, error = %e, "Environment creation failed, removing partial environment");
                self.discard_partial(&request.name, &root).await;
                Err(e)
            }
        }
    }

    async fn create_root(
        &self,
        request: &ProvisionRequest,
        root: &Path,
    ) -> Result<(EnvironmentHandle, Vec<(InstallStep, PathBuf)>)> {
        let base = self.base.lock().await.clone();
        if let (Some((host, base_handle)), Some(clone)) = (base.as_ref(), self.profile.clone.as_ref()) {
            if host == &request.host_library {
                let rendered = render(clone, root, Some(base_handle.root()), None);
                let output = self.run_template("clone", rendered).await?;
                if !output.success() {
                    return Err(EnvError::CreationFailed {
                        env: request.name.clone(),
                        detail: output.tail(),
                    });
                }
                info!(env = %request.name, base = %base_handle.name(), "Cloned base environment");
                let handle = EnvironmentHandle::cloned(base_handle, &request.name, root.to_path_buf());
                return Ok((handle, request.plugin_steps()));
            }
        }

        let rendered = render(&self.profile.create, root, None, None);
        let output = self.run_template("create", rendered).await?;
        if !output.success() {
            return Err(EnvError::CreationFailed {
                env: request.name.clone(),
                detail: output.tail(),
            });
        }
        Ok((EnvironmentHandle::new(&request.name, root.to_path_buf()), request.install_plan()))
    }

    /// Remove whatever a failed create or clone left under `root`. Never fails.
    async fn discard_partial(&self, name: &str, root: &Path) {
        if let Some(template) = &self.profile.remove {
            let rendered = render(template, root, None, None);
            match self.run_template("remove", rendered).await {
                Ok(output) if output.success() => {}
                Ok(output) => debug!(env = name, detail = %output.tail(), "Remove template failed on partial environment"),
                Err(e) => debug!(env = name, error = %e, "Remove template failed on partial environment"),
            }
        }
        if root.exists() {
            if let Err(e) = std::fs::remove_dir_all(root) {
                warn!(env = name, root = %root.display(), error = %e, "EnvironmentTeardownFailed: partial environment left on disk");
            }
        }
    }

    async fn install(&self, handle: &mut EnvironmentHandle, steps: Vec<(InstallStep, PathBuf)>) -> Result<()> {
        handle.transition(EnvState::DependenciesInstalling)?;

        for (step, source) in steps {
            let Some(template) = self.profile.install_template(step) else {
                warn!(
                    env = %handle.name(),
                    step = %step,
                    profile = %self.profile.name,
                    "Profile has no template for install step, skipping"
                );
                continue;
            };

            let rendered = render(template, handle.root(), None, Some(&source));
            let output = self.run_template(step.name(), rendered).await?;
            if !output.success() {
                return Err(EnvError::DependencyInstallFailed {
                    env: handle.name().to_string(),
                    step,
                    exit_code: output.exit_code,
                    detail: output.tail(),
                });
            }
            debug!(env = %handle.name(), step = %step, duration_ms = output.duration_ms, "Install step complete");
            handle.record_install(step, source);
        }

        handle.transition(EnvState::Ready)
    }
}

#[async_trait]
impl EnvironmentProvisioner for CommandProvisioner {
    fn backend(&self) -> &str {
        &self.profile.name
    }

    async fn prepare_base(&self, host_library: &Path) -> Result<()> {
        if !self.reuse_base || self.profile.clone.is_none() {
            return Ok(());
        }

        let request = ProvisionRequest::new(BASE_ENV_NAME, host_library);
        let (mut handle, steps) = self.create(&request).await?;
        if let Err(e) = self.install(&mut handle, steps).await {
            release_failed(self, handle).await;
            return Err(e);
        }

        let digest = handle.component_digest();
        info!(env = %handle.name(), digest = %&digest[..12], "Base environment ready");
        *self.base.lock().await = Some((host_library.to_path_buf(), handle));
        Ok(())
    }

    async fn release_base(&self) -> Result<()> {
        let base = self.base.lock().await.take();
        match base {
            Some((_, handle)) => self.teardown(handle).await,
            None => Ok(()),
        }
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<EnvironmentHandle> {
        for spec in &request.environment_specs {
            load_environment_spec(spec, &self.python_series)?;
        }

        info!(env = %request.name, backend = %self.profile.name, "Provisioning environment");
        let (mut handle, steps) = self.create(request).await?;

        match self.install(&mut handle, steps).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                warn!(env = %request.name, error = %e, "Provisioning failed, releasing environment");
                release_failed(self, handle).await;
                Err(e)
            }
        }
    }

    fn command(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EnvError::InvalidTemplate("test command".to_string()))?;

        let bin = handle.root().join(&self.profile.bin_dir);
        let local = bin.join(program);
        let program = if local.is_file() { local } else { PathBuf::from(program) };

        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let mut paths = vec![bin.clone()];
                paths.extend(std::env::split_paths(&existing));
                std::env::join_paths(paths).unwrap_or(existing)
            }
            None => bin.clone().into_os_string(),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("PATH", path)
            .env(&self.profile.activation_var, handle.root());
        Ok(cmd)
    }

    async fn teardown(&self, mut handle: EnvironmentHandle) -> Result<()> {
        handle.transition(EnvState::TornDown)?;

        match &self.profile.remove {
            Some(template) => {
                let rendered = render(template, handle.root(), None, None);
                let output = self.run_template("remove", rendered).await?;
                if !output.success() {
                    return Err(EnvError::TeardownFailed {
                        env: handle.name().to_string(),
                        detail: output.tail(),
                    });
                }
            }
            None => {
                if handle.root().exists() {
                    std::fs::remove_dir_all(handle.root()).map_err(|e| EnvError::TeardownFailed {
                        env: handle.name().to_string(),
                        detail: e.to_string(),
                    })?;
                }
            }
        }

        debug!(env = %handle.name(), id = %handle.short_id(), "Environment torn down");
        Ok(())
    }
}
