//! Test execution for a single target.

use crate::error::CiError;
use crate::outcome::{OutcomeStatus, TestOutcome, TestTarget};
use crate::resolver::PluginDescriptor;
use crate::selection::{TestHarness, TestSelection};
use plugin_env::{run_bounded, EnvironmentHandle, EnvironmentProvisioner};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code recorded when the harness could not be started at all
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// The tests one target runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlan {
    pub target: TestTarget,
    /// Test paths in execution order.
    pub test_paths: Vec<PathBuf>,
    /// Passed to generic plugin tests so they know which plugin to load.
    pub plugin_directory: Option<PathBuf>,
}

impl TargetPlan {
    pub fn plugin(descriptor: &PluginDescriptor) -> Self {
        let plugin_directory = descriptor
            .generic_test
            .as_ref()
            .map(|_| descriptor.directory.clone());
        let test_paths = if descriptor.has_test_file {
            descriptor.test_paths()
        } else {
            Vec::new()
        };
        Self {
            target: TestTarget::Plugin(descriptor.key()),
            test_paths,
            plugin_directory,
        }
    }

    pub fn core(repo_root: &Path, core_test_paths: &[String]) -> Self {
        Self {
            target: TestTarget::Core,
            test_paths: core_test_paths.iter().map(|p| repo_root.join(p)).collect(),
            plugin_directory: None,
        }
    }
}

/// Where the harness process runs.
#[derive(Clone, Copy)]
pub enum ExecutionEnv<'a> {
    /// Directly on the host, in the orchestrator's own environment.
    Host,
    Provisioned {
        provisioner: &'a dyn EnvironmentProvisioner,
        handle: &'a EnvironmentHandle,
    },
}

/// Runs a target's test suite and records the outcome.
#[derive(Debug, Clone)]
pub struct TestExecutor {
    harness: TestHarness,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    report_dir: Option<PathBuf>,
}

impl TestExecutor {
    pub fn new(harness: TestHarness, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            harness,
            working_dir: working_dir.into(),
            timeout: None,
            report_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_report_dir(mut self, report_dir: Option<PathBuf>) -> Self {
        self.report_dir = report_dir;
        self
    }

    /// Report artifact location for `target`, if reports are enabled.
    pub fn report_path(&self, target: &TestTarget) -> Option<PathBuf> {
        self.report_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.xml", target.name())))
    }

    /// Run `plan` inside `env`. Never fails: every problem becomes an outcome.
    pub async fn run(&self, plan: &TargetPlan, env: ExecutionEnv<'_>, selection: &TestSelection) -> TestOutcome {
        let target = plan.target.clone();
        let accepts_no_tests = selection.accepts_no_tests();

        if plan.test_paths.is_empty() {
            let err = CiError::NoTestsCollected {
                target: target.to_string(),
            };
            warn!(target = %target, accepted = accepts_no_tests, "{}", err);
            return TestOutcome::no_tests(target, accepts_no_tests);
        }

        let start = Instant::now();
        let report = self.report_path(&target);
        if let Some(dir) = &self.report_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "Cannot create report directory, continuing without report");
            }
        }
        if let Some(path) = &report {
            // A stale artifact must not stand in for this run's report
            match std::fs::remove_file(path) {
                Ok(()) => debug!(report = %path.display(), "Removed stale report"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(report = %path.display(), error = %e, "Cannot remove stale report"),
            }
        }

        let argv = self.harness.argv(
            &plan.test_paths,
            selection,
            report.as_deref(),
            plan.plugin_directory.as_deref(),
        );

        let mut command = match env {
            ExecutionEnv::Host => {
                let Some((program, args)) = argv.split_first() else {
                    return self.execution_failed(target, accepts_no_tests, start, "empty test command");
                };
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            ExecutionEnv::Provisioned { provisioner, handle } => match provisioner.command(handle, &argv) {
                Ok(command) => command,
                Err(e) => {
                    return self.execution_failed(target, accepts_no_tests, start, e.to_string());
                }
            },
        };
        command.current_dir(&self.working_dir);

        info!(target = %target, selection = ?selection, "Running tests");
        let label = format!("tests for {}", target);
        let output = match run_bounded(command, &label, self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                return self.execution_failed(target, accepts_no_tests, start, e.to_string());
            }
        };

        let mut outcome = if output.timed_out {
            TestOutcome::timed_out(target, accepts_no_tests).with_diagnostic(output.tail())
        } else {
            let outcome = TestOutcome::new(target, output.exit_code, accepts_no_tests);
            if outcome.passed() {
                outcome
            } else {
                outcome.with_diagnostic(output.tail())
            }
        };
        outcome.duration_ms = output.duration_ms;
        outcome.report_artifact = report.filter(|path| path.is_file());

        match outcome.status {
            OutcomeStatus::Passed => {
                info!(target = %outcome.target, duration_ms = outcome.duration_ms, "Tests passed")
            }
            OutcomeStatus::NoTests => {
                info!(target = %outcome.target, accepted = accepts_no_tests, "No tests collected")
            }
            _ => warn!(
                target = %outcome.target,
                exit_code = outcome.exit_code,
                detail = outcome.diagnostic.as_deref().unwrap_or(""),
                "Tests failed"
            ),
        }
        outcome
    }

    fn execution_failed(
        &self,
        target: TestTarget,
        accepts_no_tests: bool,
        start: Instant,
        detail: impl Into<String>,
    ) -> TestOutcome {
        let err = CiError::TestExecutionFailed {
            target: target.to_string(),
            detail: detail.into(),
        };
        warn!(target = %target, "{}", err);
        TestOutcome::new(target, EXIT_SPAWN_FAILED, accepts_no_tests)
            .with_diagnostic(err.to_string())
            .with_duration(start.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PluginKey;
    use crate::kind::PluginKind;
    use crate::outcome::{EXIT_NO_TESTS, TIMEOUT_EXIT_CODE};
    use tempfile::tempdir;

    fn sh(script: &str) -> TestHarness {
        TestHarness::command(vec!["sh".to_string(), "-c".to_string(), script.to_string(), "harness".to_string()])
    }

    fn plan(paths: &[&str]) -> TargetPlan {
        TargetPlan {
            target: TestTarget::Plugin(PluginKey::new(PluginKind::Model, "alexnet")),
            test_paths: paths.iter().map(PathBuf::from).collect(),
            plugin_directory: None,
        }
    }

    #[tokio::test]
    async fn test_passing_run() {
        let dir = tempdir().unwrap();
        let executor = TestExecutor::new(sh("exit 0"), dir.path());
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &TestSelection::All).await;
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.passed());
        assert!(outcome.diagnostic.is_none());
    }

    #[tokio::test]
    async fn test_failing_run_keeps_exit_code() {
        let dir = tempdir().unwrap();
        let executor = TestExecutor::new(sh("echo 'AssertionError: boom' >&2; exit 3"), dir.path());
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &TestSelection::All).await;
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.diagnostic.as_deref(), Some("AssertionError: boom"));
    }

    #[tokio::test]
    async fn test_missing_test_files_report_no_tests() {
        let dir = tempdir().unwrap();
        let executor = TestExecutor::new(sh("exit 1"), dir.path());
        let outcome = executor.run(&plan(&[]), ExecutionEnv::Host, &TestSelection::All).await;
        assert_eq!(outcome.exit_code, EXIT_NO_TESTS);
        assert!(outcome.passed());

        let named = TestSelection::Named("test_exact".to_string());
        let outcome = executor.run(&plan(&[]), ExecutionEnv::Host, &named).await;
        assert_eq!(outcome.exit_code, EXIT_NO_TESTS);
        assert!(!outcome.passed());
    }

    #[tokio::test]
    async fn test_harness_exit_five_under_named_selection_fails() {
        let dir = tempdir().unwrap();
        let executor = TestExecutor::new(sh("exit 5"), dir.path());
        let named = TestSelection::Named("test_missing".to_string());
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &named).await;
        assert_eq!(outcome.status, OutcomeStatus::NoTests);
        assert!(!outcome.passed());
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempdir().unwrap();
        let executor = TestExecutor::new(sh("sleep 5"), dir.path()).with_timeout(Some(Duration::from_millis(100)));
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &TestSelection::All).await;
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_report_artifact_recorded_when_written() {
        let dir = tempdir().unwrap();
        let reports = dir.path().join("reports");
        // The report argument is the last one: `--junitxml=<path>`
        let script = r#"for a; do last="$a"; done; echo '<testsuite name="t" tests="1"></testsuite>' > "${last#--junitxml=}""#;
        let executor = TestExecutor::new(sh(script), dir.path()).with_report_dir(Some(reports.clone()));
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &TestSelection::All).await;
        assert!(outcome.passed(), "{:?}", outcome);
        assert_eq!(outcome.report_artifact, Some(reports.join("models__alexnet.xml")));
    }

    #[tokio::test]
    async fn test_stale_report_not_attributed_to_new_run() {
        let dir = tempdir().unwrap();
        let reports = dir.path().join("reports");
        std::fs::create_dir_all(&reports).unwrap();
        let stale = reports.join("models__alexnet.xml");
        std::fs::write(&stale, "<testsuite name=\"old\" tests=\"1\"></testsuite>").unwrap();

        let executor = TestExecutor::new(sh("exit 1"), dir.path()).with_report_dir(Some(reports));
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &TestSelection::All).await;
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.report_artifact, None);
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_unstartable_harness() {
        let dir = tempdir().unwrap();
        let executor = TestExecutor::new(
            TestHarness::command(vec!["/nonexistent/harness-binary".to_string()]),
            dir.path(),
        );
        let outcome = executor.run(&plan(&["test.py"]), ExecutionEnv::Host, &TestSelection::All).await;
        assert_eq!(outcome.exit_code, EXIT_SPAWN_FAILED);
        assert!(!outcome.passed());
    }

    #[test]
    fn test_core_plan_joins_repo_root() {
        let plan = TargetPlan::core(Path::new("/repo"), &["tests".to_string()]);
        assert_eq!(plan.target, TestTarget::Core);
        assert_eq!(plan.test_paths, vec![PathBuf::from("/repo/tests")]);
    }
}
