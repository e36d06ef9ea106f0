//! Plugin test pipeline orchestration.
//!
//! classify → resolve → provision → execute → aggregate. A full-suite run
//! tests the core suite plus every plugin of each kind whose shared code
//! changed. Plugin targets run concurrently under a semaphore; each target
//! exclusively owns its environment handle and always tears it down.
//! Outcomes land in indexed slots so the verdict preserves discovery order
//! regardless of completion order.

use crate::classifier::{analyze, classify, ChangeSet, PluginKey, RunMode};
use crate::config::{FailurePolicy, PipelineConfig};
use crate::error::{CiError, Result};
use crate::gate::{AggregateVerdict, ResultAggregator};
use crate::outcome::{OutcomeStatus, TestOutcome, TestTarget};
use crate::report::merge_reports;
use crate::resolver::{PluginDescriptor, PluginResolver};
use crate::runner::{ExecutionEnv, TargetPlan, TestExecutor};
use crate::selection::TestSelection;
use plugin_env::{EnvironmentHandle, EnvironmentProvisioner};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a complete pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,

    pub mode: RunMode,

    pub verdict: AggregateVerdict,

    /// Combined report, if one was written.
    pub merged_report: Option<PathBuf>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn exit_code(&self) -> i32 {
        self.verdict.overall_exit_code
    }
}

/// Provision an environment for testing `descriptor`.
pub async fn provision_plugin(
    provisioner: &dyn EnvironmentProvisioner,
    descriptor: &PluginDescriptor,
    host_library: &Path,
) -> Result<EnvironmentHandle> {
    let request = descriptor.provision_request(host_library);
    Ok(provisioner.provision(&request).await?)
}

/// Per-target work shared by all dispatched tasks.
struct TargetRunner {
    resolver: PluginResolver,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    executor: TestExecutor,
    host_library: PathBuf,
    policy: FailurePolicy,
    cancel: CancellationToken,
}

impl TargetRunner {
    async fn run(&self, key: PluginKey, selection: &TestSelection) -> TestOutcome {
        let start = Instant::now();
        let target = TestTarget::Plugin(key.clone());

        let descriptor = match self.resolver.resolve_key(&key) {
            Ok(descriptor) => descriptor,
            Err(e @ CiError::PluginNotFound { .. }) => {
                error!(plugin = %key, "{}", e);
                return TestOutcome::plugin_not_found(key, e.to_string());
            }
            Err(e) => {
                error!(plugin = %key, error = %e, "Plugin resolution failed");
                return TestOutcome::new(target, 1, false).with_diagnostic(e.to_string());
            }
        };

        let plan = TargetPlan::plugin(&descriptor);
        if plan.test_paths.is_empty() {
            // Nothing to run, so no environment either
            return self.executor.run(&plan, ExecutionEnv::Host, selection).await;
        }

        let mut handle =
            match provision_plugin(self.provisioner.as_ref(), &descriptor, &self.host_library).await {
                Ok(handle) => handle,
                Err(e) => {
                    let step = match &e {
                        CiError::Environment(env) => env.failed_step().map(|s| s.name()),
                        _ => None,
                    };
                    error!(plugin = %key, step = step.unwrap_or("-"), error = %e, "Provisioning failed");
                    if self.policy == FailurePolicy::AbortOnProvisionFailure {
                        warn!(plugin = %key, "Aborting targets that have not started");
                        self.cancel.cancel();
                    }
                    return TestOutcome::provisioning_failed(target, e.to_string())
                        .with_duration(start.elapsed().as_millis() as u64);
                }
            };

        debug!(plugin = %key, env = %handle.name(), id = %handle.short_id(), "Environment ready");

        let mut outcome = match handle.acquire() {
            Ok(()) => {
                let env = ExecutionEnv::Provisioned {
                    provisioner: self.provisioner.as_ref(),
                    handle: &handle,
                };
                self.executor.run(&plan, env, selection).await
            }
            Err(e) => TestOutcome::provisioning_failed(target, e.to_string()),
        };

        let env_name = handle.name().to_string();
        if let Err(e) = self.provisioner.teardown(handle).await {
            warn!(env = %env_name, error = %e, "EnvironmentTeardownFailed");
            outcome.teardown_warning = Some(e.to_string());
        }

        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }
}

/// Selective plugin test orchestrator.
pub struct PluginPipeline {
    config: Arc<PipelineConfig>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
}

impl PluginPipeline {
    pub fn new(config: PipelineConfig, provisioner: Arc<dyn EnvironmentProvisioner>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            provisioner,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn executor(&self) -> TestExecutor {
        TestExecutor::new(self.config.harness.clone(), &self.config.repo_root)
            .with_timeout(self.config.test_timeout())
            .with_report_dir(self.config.report_dir.clone())
    }

    /// Decide what to test. Ambiguous paths are logged and count as core.
    pub fn plan(&self, change_set: &ChangeSet) -> RunMode {
        let report = analyze(change_set, &self.config.library, &self.config.special_files);
        for reason in &report.ambiguous_paths {
            warn!(reason = %reason, "ClassificationAmbiguous: treating path as core");
        }

        let mut mode = classify(change_set, &self.config.library);
        if let (RunMode::PluginOnly(plugins), Some(kind)) = (&mut mode, self.config.kind_filter) {
            let before = plugins.len();
            plugins.retain_kind(kind);
            if plugins.len() < before {
                info!(kind = %kind, kept = plugins.len(), dropped = before - plugins.len(), "Applied kind filter");
            }
        }
        mode
    }

    /// Every plugin of each kind whose shared code changed (helper
    /// directories, kind-root files, special files), in kind then
    /// discovery order.
    pub fn shared_code_plugins(&self, change_set: &ChangeSet) -> Vec<PluginKey> {
        let report = analyze(change_set, &self.config.library, &self.config.special_files);
        let resolver = PluginResolver::new(self.config.library_root());

        let mut plugins = Vec::new();
        for kind in report.test_all_kinds {
            match resolver.discover(kind) {
                Ok(keys) => {
                    info!(kind = %kind, plugins = keys.len(), "Shared plugin code changed, testing every plugin of kind");
                    plugins.extend(keys);
                }
                Err(e) => warn!(kind = %kind, error = %e, "Plugin discovery failed"),
            }
        }
        plugins
    }

    /// Run the pipeline for a change set.
    pub async fn run(&self, change_set: &ChangeSet, test: Option<&str>) -> Result<PipelineResult> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let selection = TestSelection::for_context(test, &self.config.context);

        info!(
            run_id = %run_id,
            changed = change_set.len(),
            library = %self.config.library,
            backend = self.provisioner.backend(),
            "Starting plugin test pipeline"
        );

        let mode = self.plan(change_set);
        let (outcomes, skipped) = match &mode {
            RunMode::FullSuite => {
                info!(run_id = %run_id, "Core change detected, running full suite");
                let mut outcomes = vec![self.run_core(&selection).await];
                let (plugin_outcomes, skipped) = self
                    .run_plugins(self.shared_code_plugins(change_set), &selection)
                    .await;
                outcomes.extend(plugin_outcomes);
                (outcomes, skipped)
            }
            RunMode::PluginOnly(plugins) => {
                info!(run_id = %run_id, plugins = plugins.len(), "Plugin-only change, testing affected plugins");
                self.run_plugins(plugins.iter().cloned().collect(), &selection)
                    .await
            }
        };

        let verdict = ResultAggregator::aggregate_with_skipped(outcomes, skipped);
        let merged_report = self.merge(&verdict);
        let duration_ms = start.elapsed().as_millis() as u64;

        if verdict.passed() {
            info!(run_id = %run_id, duration_ms, "{}", verdict.message);
        } else {
            warn!(run_id = %run_id, exit_code = verdict.overall_exit_code, duration_ms, "{}", verdict.message);
        }

        Ok(PipelineResult {
            run_id,
            mode,
            verdict,
            merged_report,
            duration_ms,
        })
    }

    /// Run the core suite on the host. An empty collection fails here.
    pub async fn run_core(&self, selection: &TestSelection) -> TestOutcome {
        let plan = TargetPlan::core(&self.config.repo_root, &self.config.core_test_paths);
        let mut outcome = self.executor().run(&plan, ExecutionEnv::Host, selection).await;
        outcome.accepts_no_tests = false;
        outcome
    }

    /// Test `plugins` concurrently. Returns outcomes in input order plus the
    /// targets skipped by a global abort.
    pub async fn run_plugins(
        &self,
        plugins: Vec<PluginKey>,
        selection: &TestSelection,
    ) -> (Vec<TestOutcome>, Vec<TestTarget>) {
        if plugins.is_empty() {
            debug!("No plugins to test");
            return (Vec::new(), Vec::new());
        }

        let host_library = self.config.repo_root.clone();
        if self.config.reuse_base {
            if let Err(e) = self.provisioner.prepare_base(&host_library).await {
                warn!(error = %e, "Base environment unavailable, provisioning each plugin from scratch");
            }
        }

        let runner = Arc::new(TargetRunner {
            resolver: PluginResolver::new(self.config.library_root()),
            provisioner: Arc::clone(&self.provisioner),
            executor: self.executor(),
            host_library,
            policy: self.config.failure_policy,
            cancel: CancellationToken::new(),
        });

        // Semaphore enforces the concurrency limit
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(plugins.len());

        for key in &plugins {
            let runner = Arc::clone(&runner);
            let sem = Arc::clone(&sem);
            let key = key.clone();
            let selection = selection.clone();

            let task = tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = runner.cancel.cancelled() => return None,
                    permit = sem.acquire_owned() => permit.ok()?,
                };
                if runner.cancel.is_cancelled() {
                    return None;
                }
                Some(runner.run(key, &selection).await)
            });
            tasks.push(task);
        }

        let joined = futures::future::join_all(tasks).await;

        // One slot per discovered target
        let mut slots: Vec<Option<TestOutcome>> = Vec::with_capacity(plugins.len());
        for (key, result) in plugins.iter().zip(joined) {
            let slot = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(plugin = %key, error = %e, "Target task panicked");
                    Some(
                        TestOutcome::new(TestTarget::Plugin(key.clone()), 1, false)
                            .with_diagnostic(format!("target task failed: {}", e)),
                    )
                }
            };
            slots.push(slot);
        }

        if let Err(e) = self.provisioner.release_base().await {
            warn!(error = %e, "EnvironmentTeardownFailed: base environment");
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        let mut skipped = Vec::new();
        for (key, slot) in plugins.into_iter().zip(slots) {
            match slot {
                Some(outcome) => outcomes.push(outcome),
                None => {
                    info!(plugin = %key, "Skipped after abort");
                    skipped.push(TestTarget::Plugin(key));
                }
            }
        }
        (outcomes, skipped)
    }

    fn merge(&self, verdict: &AggregateVerdict) -> Option<PathBuf> {
        let output = self.config.merged_report_path()?;
        let executor = self.executor();

        let artifacts: Vec<PathBuf> = verdict
            .outcomes
            .iter()
            .filter_map(|o| match o.status {
                _ if o.report_artifact.is_some() => o.report_artifact.clone(),
                // The harness ran, so a report was expected
                OutcomeStatus::Passed | OutcomeStatus::Failed | OutcomeStatus::TimedOut => {
                    executor.report_path(&o.target)
                }
                _ => None,
            })
            .collect();

        match merge_reports(&artifacts, &output) {
            Ok(summary) => summary.output,
            Err(e) => {
                warn!(output = %output.display(), error = %e, "ReportMergeFailed");
                None
            }
        }
    }
}
