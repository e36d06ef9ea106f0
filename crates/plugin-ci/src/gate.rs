//! Verdict aggregation across target outcomes.

use crate::outcome::{OutcomeStatus, TestOutcome, TestTarget, EXIT_PASSED};
use serde::{Deserialize, Serialize};

/// One build verdict for all targets of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVerdict {
    /// First failing exit code in outcome order, else 0.
    pub overall_exit_code: i32,

    /// Outcomes in discovery order.
    pub outcomes: Vec<TestOutcome>,

    /// Targets never started because of a global abort.
    pub skipped: Vec<TestTarget>,

    /// Summary message.
    pub message: String,
}

impl AggregateVerdict {
    pub fn passed(&self) -> bool {
        self.overall_exit_code == EXIT_PASSED
    }

    pub fn failed(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Outcomes whose environment could not be torn down.
    pub fn teardown_warnings(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|o| o.teardown_warning.is_some())
    }
}

/// Folds outcomes into a verdict.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Aggregate outcomes. Deterministic: depends only on outcome order and
    /// exit codes.
    ///
    /// Rule:
    /// - exit 0 passes
    /// - exit 5 passes when the target accepts an empty collection
    /// - the overall code is the first code that does not pass
    pub fn aggregate(outcomes: Vec<TestOutcome>) -> AggregateVerdict {
        Self::aggregate_with_skipped(outcomes, Vec::new())
    }

    pub fn aggregate_with_skipped(outcomes: Vec<TestOutcome>, skipped: Vec<TestTarget>) -> AggregateVerdict {
        let overall_exit_code = outcomes
            .iter()
            .find(|o| !o.passed())
            .map(|o| o.exit_code)
            .unwrap_or(EXIT_PASSED);

        let failed = outcomes.iter().filter(|o| !o.passed()).count();
        let mut message = if failed == 0 {
            format!("All {} target(s) passed", outcomes.len())
        } else {
            format!("{} of {} target(s) failed", failed, outcomes.len())
        };
        if !skipped.is_empty() {
            message.push_str(&format!(", {} skipped", skipped.len()));
        }

        AggregateVerdict {
            overall_exit_code,
            outcomes,
            skipped,
            message,
        }
    }
}
