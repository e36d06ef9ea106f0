//! Per-target test outcomes.

use crate::classifier::PluginKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use plugin_env::{SIGNAL_EXIT_CODE, TIMEOUT_EXIT_CODE};

/// All selected tests passed
pub const EXIT_PASSED: i32 = 0;

/// The harness collected no tests
pub const EXIT_NO_TESTS: i32 = 5;

/// No plugin directory matched the identifier
pub const EXIT_PLUGIN_NOT_FOUND: i32 = 66;

/// The target's environment could not be provisioned
pub const EXIT_PROVISION_FAILED: i32 = 70;

/// What a test run was about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum TestTarget {
    /// The library's core test suite.
    Core,
    Plugin(PluginKey),
}

impl TestTarget {
    /// Stable name, used for report artifacts and logs.
    pub fn name(&self) -> String {
        match self {
            TestTarget::Core => "core".to_string(),
            TestTarget::Plugin(key) => key.env_name(),
        }
    }

    pub fn plugin(&self) -> Option<&PluginKey> {
        match self {
            TestTarget::Core => None,
            TestTarget::Plugin(key) => Some(key),
        }
    }
}

impl std::fmt::Display for TestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestTarget::Core => f.write_str("core"),
            TestTarget::Plugin(key) => write!(f, "{}", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Passed,
    Failed,
    NoTests,
    PluginNotFound,
    ProvisioningFailed,
    TimedOut,
}

impl OutcomeStatus {
    /// Status implied by a harness exit code.
    pub fn from_exit_code(exit_code: i32) -> Self {
        match exit_code {
            EXIT_PASSED => OutcomeStatus::Passed,
            EXIT_NO_TESTS => OutcomeStatus::NoTests,
            _ => OutcomeStatus::Failed,
        }
    }
}

/// Result of one target run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub target: TestTarget,
    pub status: OutcomeStatus,
    pub exit_code: i32,
    /// Exit code 5 counts as a pass for this target.
    pub accepts_no_tests: bool,
    pub report_artifact: Option<PathBuf>,
    pub duration_ms: u64,
    /// Short failure description.
    pub diagnostic: Option<String>,
    /// Set when the environment could not be torn down after the run.
    pub teardown_warning: Option<String>,
}

impl TestOutcome {
    pub fn new(target: TestTarget, exit_code: i32, accepts_no_tests: bool) -> Self {
        Self {
            target,
            status: OutcomeStatus::from_exit_code(exit_code),
            exit_code,
            accepts_no_tests,
            report_artifact: None,
            duration_ms: 0,
            diagnostic: None,
            teardown_warning: None,
        }
    }

    pub fn no_tests(target: TestTarget, accepts_no_tests: bool) -> Self {
        Self::new(target, EXIT_NO_TESTS, accepts_no_tests)
            .with_diagnostic("no test files found")
    }

    pub fn plugin_not_found(key: PluginKey, detail: impl Into<String>) -> Self {
        let mut outcome = Self::new(TestTarget::Plugin(key), EXIT_PLUGIN_NOT_FOUND, false);
        outcome.status = OutcomeStatus::PluginNotFound;
        outcome.with_diagnostic(detail)
    }

    pub fn provisioning_failed(target: TestTarget, detail: impl Into<String>) -> Self {
        let mut outcome = Self::new(target, EXIT_PROVISION_FAILED, false);
        outcome.status = OutcomeStatus::ProvisioningFailed;
        outcome.with_diagnostic(detail)
    }

    pub fn timed_out(target: TestTarget, accepts_no_tests: bool) -> Self {
        let mut outcome = Self::new(target, TIMEOUT_EXIT_CODE, accepts_no_tests);
        outcome.status = OutcomeStatus::TimedOut;
        outcome
    }

    pub fn with_diagnostic(mut self, detail: impl Into<String>) -> Self {
        self.diagnostic = Some(detail.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Exit code 0, or 5 where accepted.
    pub fn passed(&self) -> bool {
        self.exit_code == EXIT_PASSED || (self.exit_code == EXIT_NO_TESTS && self.accepts_no_tests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::PluginKind;

    fn alexnet() -> TestTarget {
        TestTarget::Plugin(PluginKey::new(PluginKind::Model, "alexnet"))
    }

    #[test]
    fn test_target_names() {
        assert_eq!(TestTarget::Core.name(), "core");
        assert_eq!(alexnet().name(), "models__alexnet");
        assert_eq!(alexnet().to_string(), "models/alexnet");
    }

    #[test]
    fn test_no_tests_pass_depends_on_selection() {
        assert!(TestOutcome::no_tests(alexnet(), true).passed());
        assert!(!TestOutcome::no_tests(alexnet(), false).passed());
    }

    #[test]
    fn test_failure_statuses() {
        let o = TestOutcome::new(alexnet(), 1, true);
        assert_eq!(o.status, OutcomeStatus::Failed);
        assert!(!o.passed());

        let o = TestOutcome::provisioning_failed(alexnet(), "pip exited 1");
        assert_eq!(o.exit_code, EXIT_PROVISION_FAILED);
        assert!(!o.passed());

        let o = TestOutcome::timed_out(alexnet(), true);
        assert_eq!(o.exit_code, 124);
        assert_eq!(o.status, OutcomeStatus::TimedOut);
    }
}
