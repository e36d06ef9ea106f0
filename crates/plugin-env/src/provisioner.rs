//! The provisioner seam between orchestration and package managers.

use crate::handle::{EnvState, EnvironmentHandle, ProvisionRequest};
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Creates, populates and releases isolated dependency environments.
///
/// Implementations own the package-manager specifics. Callers only see the
/// lifecycle: `provision` returns a `Ready` handle or an error (in which case
/// any partially created environment has already been released), and
/// `teardown` consumes the handle.
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Short backend name for logs (e.g. "conda", "simulated")
    fn backend(&self) -> &str;

    /// Prepare a reusable base environment containing only the host library.
    ///
    /// Subsequent `provision` calls for the same host library may clone it
    /// instead of installing from scratch. Backends without reuse support
    /// treat this as a no-op.
    async fn prepare_base(&self, _host_library: &Path) -> Result<()> {
        Ok(())
    }

    /// Release the base environment, if one was prepared.
    async fn release_base(&self) -> Result<()> {
        Ok(())
    }

    /// Create an environment and install the request's install plan in order.
    async fn provision(&self, request: &ProvisionRequest) -> Result<EnvironmentHandle>;

    /// Build a command that executes `argv` inside the environment.
    fn command(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<Command>;

    /// Destroy the environment. Runs on both success and failure paths.
    async fn teardown(&self, handle: EnvironmentHandle) -> Result<()>;
}

/// Release `handle` after a failed install, logging rather than masking the
/// original error.
pub(crate) async fn release_failed<P>(provisioner: &P, mut handle: EnvironmentHandle)
where
    P: EnvironmentProvisioner + ?Sized,
{
    if handle.state() == EnvState::DependenciesInstalling {
        // Only reachable from DependenciesInstalling, cannot fail
        let _ = handle.transition(EnvState::Failed);
    }
    let name = handle.name().to_string();
    if let Err(e) = provisioner.teardown(handle).await {
        tracing::warn!(env = %name, error = %e, "Teardown after failed install did not complete");
    }
}
