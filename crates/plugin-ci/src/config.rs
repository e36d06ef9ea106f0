//! Pipeline configuration.
//!
//! Everything the orchestrator needs is carried in a typed [`PipelineConfig`]
//! that is passed explicitly; the library never reads process environment
//! variables itself. The CLI fills it from a JSON file, `PLUGIN_CI_*`
//! variables and flags, in that order of precedence (lowest first).

use crate::error::{CiError, Result};
use crate::kind::PluginKind;
use crate::selection::TestHarness;
use plugin_env::DEFAULT_PYTHON_SERIES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How the pipeline reacts to a target whose environment cannot be provisioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and let the other targets continue.
    #[default]
    BestEffort,
    /// Skip every target that has not started yet.
    AbortOnProvisionFailure,
}

/// Dependency install preference for scoring runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallPreference {
    /// Dependencies are installed into the current environment.
    #[default]
    Yes,
    /// Dependencies are assumed present.
    No,
    /// Score inside a freshly provisioned environment.
    NewEnv,
}

impl FromStr for InstallPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yes" => Ok(InstallPreference::Yes),
            "no" => Ok(InstallPreference::No),
            "newenv" => Ok(InstallPreference::NewEnv),
            other => Err(format!("unknown install preference: {} (expected yes, no or newenv)", other)),
        }
    }
}

/// Flags describing where the pipeline runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContext {
    /// Resource-restricted runner (no GPU, limited memory and time).
    pub restricted: bool,
    /// Credentials for private resources are available.
    pub private_access: bool,
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Repository root; changed paths are relative to it.
    pub repo_root: PathBuf,

    /// Library namespace directory below the repo root (e.g. `brainscore_vision`).
    pub library: String,

    pub context: ExecutionContext,

    /// Restrict plugin-only runs to one kind.
    pub kind_filter: Option<PluginKind>,

    /// Maximum number of targets processed at once.
    pub concurrency: usize,

    pub failure_policy: FailurePolicy,

    /// Package manager preset for the command provisioner (`conda`, `venv`).
    pub toolchain: String,

    /// Where environments are created; defaults to `<repo_root>/.plugin-ci/envs`.
    pub envs_dir: Option<PathBuf>,

    /// Clone a prepared base environment instead of installing the host library per plugin.
    pub reuse_base: bool,

    /// Python series environment specs must pin, if they pin at all.
    pub python_series: String,

    /// Per-step install timeout in seconds (0 disables).
    pub install_timeout_secs: u64,

    /// Per-target test timeout in seconds (0 disables).
    pub test_timeout_secs: u64,

    pub harness: TestHarness,

    /// Test paths of the core suite, relative to the repo root.
    pub core_test_paths: Vec<String>,

    /// Repo-relative files whose change affects every plugin kind.
    pub special_files: Vec<String>,

    /// Directory for per-target report artifacts.
    pub report_dir: Option<PathBuf>,

    /// Merge per-target artifacts into one combined report.
    pub merge_reports: bool,

    /// Destination of the combined report.
    pub merged_report: Option<PathBuf>,

    pub install_preference: InstallPreference,

    /// Scoring command template; `{library}`, `{model}`, `{benchmark}` and
    /// `{output}` are substituted.
    pub scoring_command: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            library: String::new(),
            context: ExecutionContext::default(),
            kind_filter: None,
            concurrency: 4,
            failure_policy: FailurePolicy::default(),
            toolchain: "conda".to_string(),
            envs_dir: None,
            reuse_base: true,
            python_series: DEFAULT_PYTHON_SERIES.to_string(),
            install_timeout_secs: 1800,
            test_timeout_secs: 3600,
            harness: TestHarness::default(),
            core_test_paths: vec!["tests".to_string()],
            special_files: Vec::new(),
            report_dir: None,
            merge_reports: false,
            merged_report: None,
            install_preference: InstallPreference::default(),
            scoring_command: [
                "python",
                "-m",
                "{library}",
                "score",
                "--model",
                "{model}",
                "--benchmark",
                "{benchmark}",
                "--output",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl PipelineConfig {
    pub fn new(repo_root: impl Into<PathBuf>, library: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            library: library.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.library.trim().is_empty() {
            return Err(CiError::InvalidConfig("library namespace is empty".to_string()));
        }
        if self.library.contains('/') || self.library.contains('\\') {
            return Err(CiError::InvalidConfig(format!(
                "library namespace must be a single directory name, got {}",
                self.library
            )));
        }
        if self.concurrency == 0 {
            return Err(CiError::InvalidConfig("concurrency must be at least 1".to_string()));
        }
        if self.harness.program.is_empty() {
            return Err(CiError::InvalidConfig("test harness command is empty".to_string()));
        }
        if self.merge_reports && self.report_dir.is_none() {
            return Err(CiError::InvalidConfig(
                "report merging requires a report directory".to_string(),
            ));
        }
        Ok(())
    }

    pub fn library_root(&self) -> PathBuf {
        self.repo_root.join(&self.library)
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.envs_dir
            .clone()
            .unwrap_or_else(|| self.repo_root.join(".plugin-ci").join("envs"))
    }

    pub fn install_timeout(&self) -> Option<Duration> {
        (self.install_timeout_secs > 0).then(|| Duration::from_secs(self.install_timeout_secs))
    }

    pub fn test_timeout(&self) -> Option<Duration> {
        (self.test_timeout_secs > 0).then(|| Duration::from_secs(self.test_timeout_secs))
    }

    /// Where the combined report goes when merging is on.
    pub fn merged_report_path(&self) -> Option<PathBuf> {
        if !self.merge_reports {
            return self.merged_report.clone();
        }
        self.merged_report.clone().or_else(|| {
            self.report_dir
                .as_ref()
                .map(|dir| dir.join("combined.xml"))
        })
    }
}
