//! Plugin CI - selective plugin test orchestration
//!
//! Given the changed files of a change request this crate:
//! - Classifies them as plugin-only or core changes
//! - Resolves each affected plugin to its directory and manifests
//! - Provisions an isolated environment per plugin and runs its tests
//! - Aggregates the outcomes into one verdict and exit code
//!
//! Environments come from the `plugin-env` crate through the
//! [`plugin_env::EnvironmentProvisioner`] trait.

pub mod classifier;
pub mod config;
pub mod error;
pub mod gate;
pub mod kind;
pub mod outcome;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod scoring;
pub mod selection;
pub mod telemetry;

// Re-export key types
pub use classifier::{
    analyze, classify, classify_path, AffectedPluginSet, ChangeReport, ChangeSet, PathClass,
    PluginKey, RunMode,
};
pub use config::{ExecutionContext, FailurePolicy, InstallPreference, PipelineConfig};
pub use error::{CiError, ReportError, Result};
pub use gate::{AggregateVerdict, ResultAggregator};
pub use kind::PluginKind;
pub use outcome::{
    OutcomeStatus, TestOutcome, TestTarget, EXIT_NO_TESTS, EXIT_PASSED, EXIT_PLUGIN_NOT_FOUND,
    EXIT_PROVISION_FAILED, TIMEOUT_EXIT_CODE,
};
pub use pipeline::{provision_plugin, PipelineResult, PluginPipeline};
pub use report::{merge_reports, MergeSummary};
pub use resolver::{PluginDescriptor, PluginResolver};
pub use runner::{ExecutionEnv, TargetPlan, TestExecutor};
pub use scoring::{ScoreResult, Scorer};
pub use selection::{TagExpression, TestHarness, TestSelection};
pub use telemetry::init_tracing;
