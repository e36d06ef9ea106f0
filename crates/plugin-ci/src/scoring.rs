//! Scoring mode: score one model against one benchmark.
//!
//! With the `newenv` install preference a dedicated environment named
//! `<model>_<benchmark>` is provisioned with the host library and both
//! plugins' manifests; otherwise the scoring command runs on the host. The
//! command writes `{"score": <number>}` to an output file which is read back
//! and removed.

use crate::config::{InstallPreference, PipelineConfig};
use crate::error::{CiError, Result};
use crate::kind::PluginKind;
use crate::resolver::PluginResolver;
use plugin_env::{run_bounded, EnvironmentHandle, EnvironmentProvisioner, ProcessOutput, ProvisionRequest};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

/// A computed score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub model: String,
    pub benchmark: String,
    pub value: f64,
    pub exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct ScoreFile {
    score: f64,
}

pub struct Scorer {
    config: PipelineConfig,
    provisioner: Arc<dyn EnvironmentProvisioner>,
}

impl Scorer {
    pub fn new(config: PipelineConfig, provisioner: Arc<dyn EnvironmentProvisioner>) -> Result<Self> {
        config.validate()?;
        if config.scoring_command.is_empty() {
            return Err(CiError::InvalidConfig("scoring command is empty".to_string()));
        }
        Ok(Self { config, provisioner })
    }

    /// Environment (and score file) name. Path separators are replaced so the
    /// name always stays a single path component.
    pub fn env_name(model: &str, benchmark: &str) -> String {
        format!("{}_{}", model, benchmark).replace(['/', '\\'], "_")
    }

    /// File the scoring command writes its result to.
    pub fn score_path(&self, env_name: &str) -> PathBuf {
        self.config
            .repo_root
            .join(format!("plugin-ci-score--{}.json", env_name))
    }

    fn render(&self, model: &str, benchmark: &str, output: &std::path::Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.config
            .scoring_command
            .iter()
            .map(|arg| {
                arg.replace("{library}", &self.config.library)
                    .replace("{model}", model)
                    .replace("{benchmark}", benchmark)
                    .replace("{output}", &output)
            })
            .collect()
    }

    pub async fn score(&self, model: &str, benchmark: &str) -> Result<ScoreResult> {
        let resolver = PluginResolver::new(self.config.library_root());
        let model_plugin = resolver.locate_registered(PluginKind::Model, model)?;
        let benchmark_plugin = resolver.locate_registered(PluginKind::Benchmark, benchmark)?;

        let env_name = Self::env_name(model, benchmark);
        let output_path = self.score_path(&env_name);
        if output_path.exists() {
            std::fs::remove_file(&output_path)?;
        }
        let argv = self.render(model, benchmark, &output_path);
        let failed = |detail: String| CiError::ScoringFailed {
            model: model.to_string(),
            benchmark: benchmark.to_string(),
            detail,
        };

        info!(
            model,
            benchmark,
            model_plugin = %model_plugin.identifier,
            benchmark_plugin = %benchmark_plugin.identifier,
            preference = ?self.config.install_preference,
            "Scoring"
        );

        let output = if self.config.install_preference == InstallPreference::NewEnv {
            let request = ProvisionRequest::new(&env_name, &self.config.repo_root);
            let request = benchmark_plugin.add_manifests(model_plugin.add_manifests(request));
            let mut handle = self.provisioner.provision(&request).await?;
            let result = self.run_in(&mut handle, &argv).await;
            if let Err(e) = self.provisioner.teardown(handle).await {
                warn!(env = %env_name, error = %e, "EnvironmentTeardownFailed");
            }
            result?
        } else {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| CiError::InvalidConfig("scoring command is empty".to_string()))?;
            let mut command = Command::new(program);
            command.args(args);
            command.current_dir(&self.config.repo_root);
            run_bounded(command, "scoring", self.config.test_timeout()).await?
        };

        if !output.success() {
            return Err(failed(format!("exit code {}: {}", output.exit_code, output.tail())));
        }

        let raw = std::fs::read_to_string(&output_path)
            .map_err(|e| failed(format!("reading {}: {}", output_path.display(), e)))?;
        std::fs::remove_file(&output_path)?;
        let parsed: ScoreFile = serde_json::from_str(&raw)
            .map_err(|e| failed(format!("malformed score file: {}", e)))?;

        info!(model, benchmark, score = parsed.score, "Score computed");
        Ok(ScoreResult {
            model: model.to_string(),
            benchmark: benchmark.to_string(),
            value: parsed.score,
            exit_code: output.exit_code,
        })
    }

    async fn run_in(&self, handle: &mut EnvironmentHandle, argv: &[String]) -> Result<ProcessOutput> {
        handle.acquire()?;
        let mut command = self.provisioner.command(handle, argv)?;
        command.current_dir(&self.config.repo_root);
        Ok(run_bounded(command, "scoring", self.config.test_timeout()).await?)
    }
}
