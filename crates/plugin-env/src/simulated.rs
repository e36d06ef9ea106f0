//! In-memory provisioner for tests and dry runs
//!
//! Tracks the package set of every live environment without touching a
//! package manager. Commands run directly on the host, with the
//! environment's packages exposed as `PLUGIN_ENV_PACKAGES` (comma separated).

use crate::error::EnvError;
use crate::handle::{EnvState, EnvironmentHandle, InstallStep, ProvisionRequest};
use crate::manifest::{load_environment_spec, load_requirements, DEFAULT_PYTHON_SERIES};
use crate::provisioner::{release_failed, EnvironmentProvisioner};
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, info};

/// Variable carrying the simulated package set into child processes
pub const PACKAGES_ENV_VAR: &str = "PLUGIN_ENV_PACKAGES";

/// Variable carrying the environment name into child processes
pub const ENV_NAME_VAR: &str = "PLUGIN_ENV_NAME";

type PackageSet = BTreeSet<String>;

#[derive(Debug, Clone)]
struct InjectedFailure {
    step: InstallStep,
    env_name: Option<String>,
}

/// Provisioner backed by in-memory package sets
#[derive(Debug)]
pub struct SimulatedProvisioner {
    root: PathBuf,
    python_series: String,
    reuse_base: bool,
    failure: Option<InjectedFailure>,
    failing_teardowns: BTreeSet<String>,
    live: Mutex<HashMap<String, PackageSet>>,
    base: Mutex<Option<(PathBuf, EnvironmentHandle, PackageSet)>>,
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/simulated-envs"),
            python_series: DEFAULT_PYTHON_SERIES.to_string(),
            reuse_base: false,
            failure: None,
            failing_teardowns: BTreeSet::new(),
            live: Mutex::new(HashMap::new()),
            base: Mutex::new(None),
        }
    }

    /// Fail `step` for every environment, or only for `env_name`
    pub fn fail_on(mut self, step: InstallStep, env_name: Option<&str>) -> Self {
        self.failure = Some(InjectedFailure {
            step,
            env_name: env_name.map(str::to_string),
        });
        self
    }

    /// Make teardown of `env_name` report a failure
    pub fn fail_teardown_of(mut self, env_name: &str) -> Self {
        self.failing_teardowns.insert(env_name.to_string());
        self
    }

    pub fn with_base_reuse(mut self, enabled: bool) -> Self {
        self.reuse_base = enabled;
        self
    }

    /// Packages installed in a live environment
    pub fn packages(&self, env_name: &str) -> Option<BTreeSet<String>> {
        self.lock_live().get(env_name).cloned()
    }

    /// Names of environments that have not been torn down
    pub fn live_environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_live().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<String, PackageSet>> {
        // A poisoned map only means a test panicked mid-update
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn should_fail(&self, step: InstallStep, env_name: &str) -> bool {
        match &self.failure {
            Some(f) => f.step == step && f.env_name.as_deref().map_or(true, |n| n == env_name),
            None => false,
        }
    }

    fn packages_for(&self, step: InstallStep, source: &Path) -> Result<Vec<String>> {
        match step {
            InstallStep::HostLibrary => {
                let name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "library".to_string());
                Ok(vec![format!("host:{}", name)])
            }
            InstallStep::EnvironmentSpec => {
                Ok(load_environment_spec(source, &self.python_series)?.package_names())
            }
            InstallStep::Requirements => load_requirements(source),
        }
    }

    fn install(
        &self,
        handle: &mut EnvironmentHandle,
        mut packages: PackageSet,
        steps: Vec<(InstallStep, PathBuf)>,
    ) -> Result<PackageSet> {
        handle.transition(EnvState::DependenciesInstalling)?;
        for (step, source) in steps {
            if self.should_fail(step, handle.name()) {
                return Err(EnvError::DependencyInstallFailed {
                    env: handle.name().to_string(),
                    step,
                    exit_code: 1,
                    detail: format!("injected failure installing {}", source.display()),
                });
            }
            packages.extend(self.packages_for(step, &source)?);
            handle.record_install(step, source);
        }
        handle.transition(EnvState::Ready)?;
        Ok(packages)
    }
}

#[async_trait]
impl EnvironmentProvisioner for SimulatedProvisioner {
    fn backend(&self) -> &str {
        "simulated"
    }

    async fn prepare_base(&self, host_library: &Path) -> Result<()> {
        if !self.reuse_base {
            return Ok(());
        }
        let mut handle = EnvironmentHandle::new(crate::BASE_ENV_NAME, self.root.join(crate::BASE_ENV_NAME));
        let request = ProvisionRequest::new(crate::BASE_ENV_NAME, host_library);
        let packages = self.install(&mut handle, PackageSet::new(), request.install_plan())?;
        info!(packages = packages.len(), "Simulated base environment ready");
        *self.base.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((host_library.to_path_buf(), handle, packages));
        Ok(())
    }

    async fn release_base(&self) -> Result<()> {
        self.base.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<EnvironmentHandle> {
        let root = self.root.join(&request.name);
        let base = self.base.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let (mut handle, packages, steps) = match base {
            Some((host, base_handle, base_packages)) if host == request.host_library => (
                EnvironmentHandle::cloned(&base_handle, &request.name, root),
                base_packages,
                request.plugin_steps(),
            ),
            _ => (
                EnvironmentHandle::new(&request.name, root),
                PackageSet::new(),
                request.install_plan(),
            ),
        };

        match self.install(&mut handle, packages, steps) {
            Ok(packages) => {
                debug!(env = %request.name, packages = ?packages, "Simulated environment ready");
                self.lock_live().insert(request.name.clone(), packages);
                Ok(handle)
            }
            Err(e) => {
                release_failed(self, handle).await;
                Err(e)
            }
        }
    }

    fn command(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EnvError::InvalidTemplate("test command".to_string()))?;

        let packages = self
            .packages(handle.name())
            .map(|p| p.into_iter().collect::<Vec<_>>().join(","))
            .unwrap_or_default();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(ENV_NAME_VAR, handle.name())
            .env(PACKAGES_ENV_VAR, packages);
        Ok(cmd)
    }

    async fn teardown(&self, mut handle: EnvironmentHandle) -> Result<()> {
        handle.transition(EnvState::TornDown)?;
        if self.failing_teardowns.contains(handle.name()) {
            return Err(EnvError::TeardownFailed {
                env: handle.name().to_string(),
                detail: "simulated teardown failure".to_string(),
            });
        }
        self.lock_live().remove(handle.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plugin_with_requirements(dir: &Path, name: &str, reqs: &str) -> PathBuf {
        let plugin = dir.join(name);
        std::fs::create_dir_all(&plugin).unwrap();
        let path = plugin.join("requirements.txt");
        std::fs::write(&path, reqs).unwrap();
        path
    }

    #[tokio::test]
    async fn test_dependency_of_one_plugin_absent_from_another() {
        let repo = tempdir().unwrap();
        let a = plugin_with_requirements(repo.path(), "a", "onlyfora==1.0\n");
        let b = plugin_with_requirements(repo.path(), "b", "shared\n");
        let provisioner = SimulatedProvisioner::new();

        let env_a = provisioner
            .provision(&ProvisionRequest::new("models__a", repo.path()).with_requirements(&a))
            .await
            .unwrap();
        assert!(provisioner.packages("models__a").unwrap().contains("onlyfora"));
        provisioner.teardown(env_a).await.unwrap();

        let env_b = provisioner
            .provision(&ProvisionRequest::new("models__b", repo.path()).with_requirements(&b))
            .await
            .unwrap();
        let packages = provisioner.packages("models__b").unwrap();
        assert!(packages.contains("shared"));
        assert!(!packages.contains("onlyfora"));
        provisioner.teardown(env_b).await.unwrap();

        assert!(provisioner.live_environments().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_releases_environment() {
        let repo = tempdir().unwrap();
        let reqs = plugin_with_requirements(repo.path(), "a", "numpy\n");
        let provisioner = SimulatedProvisioner::new().fail_on(InstallStep::Requirements, Some("data__a"));

        let err = provisioner
            .provision(&ProvisionRequest::new("data__a", repo.path()).with_requirements(&reqs))
            .await
            .unwrap_err();
        assert_eq!(err.failed_step(), Some(InstallStep::Requirements));
        assert!(provisioner.live_environments().is_empty());

        // Other environments are unaffected
        let ok = provisioner
            .provision(&ProvisionRequest::new("data__b", repo.path()).with_requirements(&reqs))
            .await
            .unwrap();
        provisioner.teardown(ok).await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_preserves_base_package_set() {
        let repo = tempdir().unwrap();
        let provisioner = SimulatedProvisioner::new().with_base_reuse(true);
        provisioner.prepare_base(repo.path()).await.unwrap();

        let handle = provisioner
            .provision(&ProvisionRequest::new("metrics__x", repo.path()))
            .await
            .unwrap();
        let base = provisioner.base.lock().unwrap().clone().unwrap();

        assert_eq!(handle.component_digest(), base.1.component_digest());
        assert_eq!(provisioner.packages("metrics__x").unwrap(), base.2);
        provisioner.teardown(handle).await.unwrap();
        provisioner.release_base().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_sees_package_list() {
        let repo = tempdir().unwrap();
        let reqs = plugin_with_requirements(repo.path(), "a", "scipy\n");
        let provisioner = SimulatedProvisioner::new();
        let handle = provisioner
            .provision(&ProvisionRequest::new("metrics__a", repo.path()).with_requirements(&reqs))
            .await
            .unwrap();

        let argv: Vec<String> = vec!["sh".into(), "-c".into(), "echo $PLUGIN_ENV_PACKAGES".into()];
        let output = provisioner.command(&handle, &argv).unwrap().output().await.unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).contains("scipy"));

        provisioner.teardown(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_failure_is_reported() {
        let repo = tempdir().unwrap();
        let provisioner = SimulatedProvisioner::new().fail_teardown_of("models__leaky");
        let handle = provisioner
            .provision(&ProvisionRequest::new("models__leaky", repo.path()))
            .await
            .unwrap();
        let err = provisioner.teardown(handle).await.unwrap_err();
        assert!(matches!(err, EnvError::TeardownFailed { .. }));
    }
}
