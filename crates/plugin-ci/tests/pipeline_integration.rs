//! End-to-end pipeline runs against on-disk plugin fixtures.
//!
//! Environments come from the simulated provisioner; the test harness is a
//! small `sh` script so exit codes and reports are fully controlled.

use plugin_ci::{
    ChangeSet, FailurePolicy, OutcomeStatus, PipelineConfig, PluginKey, PluginKind, PluginPipeline,
    PluginResolver, RunMode, TestHarness, TestTarget, EXIT_NO_TESTS, EXIT_PLUGIN_NOT_FOUND,
    EXIT_PROVISION_FAILED,
};
use plugin_env::{InstallStep, SimulatedProvisioner};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn write(repo: &Path, rel: &str, body: &str) {
    let path = repo.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Library with two models with tests and one metric without.
fn fixture() -> TempDir {
    let repo = tempdir().unwrap();
    let root = repo.path();
    write(root, "lib/__init__.py", "");
    write(root, "lib/core_utils.py", "");
    write(root, "tests/test_core.py", "");
    write(root, "lib/models/alexnet/model.py", "");
    write(root, "lib/models/alexnet/test.py", "");
    write(root, "lib/models/alexnet/requirements.txt", "onlyforalexnet==1.0\n");
    write(root, "lib/models/resnet/model.py", "");
    write(root, "lib/models/resnet/test.py", "");
    write(root, "lib/models/resnet/requirements.txt", "torchvision\n");
    write(root, "lib/metrics/accuracy/metric.py", "");
    repo
}

fn config(repo: &Path, script: &str) -> PipelineConfig {
    let mut config = PipelineConfig::new(repo, "lib");
    config.harness = TestHarness::command(vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "harness".to_string(),
    ]);
    config
}

fn pipeline(config: PipelineConfig, provisioner: &Arc<SimulatedProvisioner>) -> PluginPipeline {
    PluginPipeline::new(config, provisioner.clone()).expect("valid config")
}

fn changes(paths: &[&str]) -> ChangeSet {
    ChangeSet::new(paths.iter().copied())
}

fn target_names(outcomes: &[plugin_ci::TestOutcome]) -> Vec<String> {
    outcomes.iter().map(|o| o.target.name()).collect()
}

#[tokio::test]
async fn test_single_model_change_passes() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);
    let change_set = changes(&["lib/models/alexnet/model.py"]);

    let mode = pipeline.plan(&change_set);
    let RunMode::PluginOnly(plugins) = &mode else {
        panic!("expected plugin-only mode, got {:?}", mode);
    };
    assert_eq!(
        plugins.iter().cloned().collect::<Vec<_>>(),
        vec![PluginKey::new(PluginKind::Model, "alexnet")]
    );

    let descriptor = PluginResolver::new(repo.path().join("lib"))
        .resolve(PluginKind::Model, "alexnet")
        .unwrap();
    assert!(descriptor.has_test_file);

    let result = pipeline.run(&change_set, None).await.unwrap();
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.verdict.outcomes.len(), 1);
    assert_eq!(result.verdict.outcomes[0].status, OutcomeStatus::Passed);
    assert!(provisioner.live_environments().is_empty());
}

#[tokio::test]
async fn test_core_change_runs_full_suite() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    // Fails if asked to run a plugin test file
    let script = r#"case "$*" in *lib/models/*) exit 1;; *tests*) exit 0;; esac; exit 2"#;
    let pipeline = pipeline(config(repo.path(), script), &provisioner);

    let result = pipeline
        .run(&changes(&["lib/models/alexnet/model.py", "lib/core_utils.py"]), None)
        .await
        .unwrap();
    assert_eq!(result.mode, RunMode::FullSuite);
    assert_eq!(result.verdict.outcomes.len(), 1);
    assert_eq!(result.verdict.outcomes[0].target, TestTarget::Core);
    assert_eq!(result.exit_code(), 0);
}

#[tokio::test]
async fn test_helper_change_tests_every_plugin_of_kind() {
    let repo = fixture();
    write(repo.path(), "lib/model_helpers/preprocess.py", "");
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);

    let change_set = changes(&["lib/model_helpers/preprocess.py"]);
    assert_eq!(
        pipeline.shared_code_plugins(&change_set),
        vec![
            PluginKey::new(PluginKind::Model, "alexnet"),
            PluginKey::new(PluginKind::Model, "resnet"),
        ]
    );

    let result = pipeline.run(&change_set, None).await.unwrap();
    assert_eq!(result.mode, RunMode::FullSuite);
    assert_eq!(
        target_names(&result.verdict.outcomes),
        vec!["core", "models__alexnet", "models__resnet"]
    );
    assert_eq!(result.exit_code(), 0);
    assert!(provisioner.live_environments().is_empty());
}

#[tokio::test]
async fn test_empty_change_set_runs_full_suite() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);
    let result = pipeline.run(&ChangeSet::default(), None).await.unwrap();
    assert_eq!(result.mode, RunMode::FullSuite);
}

#[tokio::test]
async fn test_plugin_without_tests_is_accepted() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let pipeline = pipeline(config(repo.path(), "exit 1"), &provisioner);

    let result = pipeline
        .run(&changes(&["lib/metrics/accuracy/metric.py"]), None)
        .await
        .unwrap();
    let outcome = &result.verdict.outcomes[0];
    assert_eq!(outcome.exit_code, EXIT_NO_TESTS);
    assert_eq!(outcome.status, OutcomeStatus::NoTests);
    assert_eq!(result.exit_code(), 0);
}

#[tokio::test]
async fn test_named_test_on_plugin_without_tests_fails() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);

    let result = pipeline
        .run(&changes(&["lib/metrics/accuracy/metric.py"]), Some("test_exact"))
        .await
        .unwrap();
    assert_eq!(result.exit_code(), EXIT_NO_TESTS);
}

#[tokio::test]
async fn test_one_failing_plugin_fails_run_in_discovery_order() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let script = r#"case "$*" in *models/resnet/*) sleep 0.2; exit 0;; *models/alexnet/*) exit 1;; esac; exit 2"#;
    let mut config = config(repo.path(), script);
    config.concurrency = 4;
    let pipeline = pipeline(config, &provisioner);

    let result = pipeline
        .run(
            &changes(&["lib/models/resnet/model.py", "lib/models/alexnet/model.py"]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code(), 1);
    assert_eq!(
        target_names(&result.verdict.outcomes),
        vec!["models__resnet", "models__alexnet"]
    );
    assert_eq!(result.verdict.outcomes[0].exit_code, 0);
    assert_eq!(result.verdict.outcomes[1].exit_code, 1);
}

#[tokio::test]
async fn test_dependencies_do_not_leak_between_plugins() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let script = r#"case "$PLUGIN_ENV_NAME:$PLUGIN_ENV_PACKAGES" in
        models__resnet:*onlyforalexnet*) exit 9;;
        models__alexnet:*onlyforalexnet*) exit 0;;
        models__resnet:*torchvision*) exit 0;;
    esac
    exit 8"#;
    for concurrency in [1, 2] {
        let mut config = config(repo.path(), script);
        config.concurrency = concurrency;
        let pipeline = pipeline(config, &provisioner);
        let result = pipeline
            .run(
                &changes(&["lib/models/alexnet/model.py", "lib/models/resnet/test.py"]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code(), 0, "{:?}", result.verdict);
        assert!(provisioner.live_environments().is_empty());
    }
}

#[tokio::test]
async fn test_provisioning_failure_is_local_under_best_effort() {
    let repo = fixture();
    let provisioner =
        Arc::new(SimulatedProvisioner::new().fail_on(InstallStep::Requirements, Some("models__alexnet")));
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);

    let result = pipeline
        .run(
            &changes(&["lib/models/alexnet/model.py", "lib/models/resnet/model.py"]),
            None,
        )
        .await
        .unwrap();
    let outcomes = &result.verdict.outcomes;
    assert_eq!(outcomes[0].status, OutcomeStatus::ProvisioningFailed);
    assert_eq!(outcomes[0].exit_code, EXIT_PROVISION_FAILED);
    assert!(outcomes[0].diagnostic.as_deref().unwrap().contains("requirements"));
    assert_eq!(outcomes[1].status, OutcomeStatus::Passed);
    assert_eq!(result.exit_code(), EXIT_PROVISION_FAILED);
    assert!(result.verdict.skipped.is_empty());
    assert!(provisioner.live_environments().is_empty());
}

#[tokio::test]
async fn test_abort_on_provision_failure_skips_pending_targets() {
    let repo = fixture();
    write(repo.path(), "lib/models/vgg/test.py", "");
    let provisioner =
        Arc::new(SimulatedProvisioner::new().fail_on(InstallStep::HostLibrary, Some("models__alexnet")));
    let mut config = config(repo.path(), "exit 0");
    config.concurrency = 1;
    config.failure_policy = FailurePolicy::AbortOnProvisionFailure;
    let pipeline = pipeline(config, &provisioner);

    let result = pipeline
        .run(
            &changes(&[
                "lib/models/alexnet/model.py",
                "lib/models/resnet/model.py",
                "lib/models/vgg/test.py",
            ]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(target_names(&result.verdict.outcomes), vec!["models__alexnet"]);
    assert_eq!(
        result.verdict.skipped,
        vec![
            TestTarget::Plugin(PluginKey::new(PluginKind::Model, "resnet")),
            TestTarget::Plugin(PluginKey::new(PluginKind::Model, "vgg")),
        ]
    );
    assert_eq!(result.exit_code(), EXIT_PROVISION_FAILED);
}

#[tokio::test]
async fn test_teardown_failure_does_not_fail_passed_run() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new().fail_teardown_of("models__alexnet"));
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);

    let result = pipeline
        .run(&changes(&["lib/models/alexnet/model.py"]), None)
        .await
        .unwrap();
    assert_eq!(result.exit_code(), 0);
    assert!(result.verdict.outcomes[0].teardown_warning.is_some());
}

#[tokio::test]
async fn test_removed_plugin_is_not_found() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let pipeline = pipeline(config(repo.path(), "exit 0"), &provisioner);

    let result = pipeline
        .run(
            &changes(&["lib/models/deleted_net/model.py", "lib/models/alexnet/model.py"]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.verdict.outcomes[0].status, OutcomeStatus::PluginNotFound);
    assert_eq!(result.verdict.outcomes[1].status, OutcomeStatus::Passed);
    assert_eq!(result.exit_code(), EXIT_PLUGIN_NOT_FOUND);
}

#[tokio::test]
async fn test_kind_filter_restricts_plugin_only_runs() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let mut config = config(repo.path(), "exit 0");
    config.kind_filter = Some(PluginKind::Metric);
    let pipeline = pipeline(config, &provisioner);

    let result = pipeline
        .run(
            &changes(&["lib/models/alexnet/model.py", "lib/metrics/accuracy/metric.py"]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(target_names(&result.verdict.outcomes), vec!["metrics__accuracy"]);
}

#[tokio::test]
async fn test_reports_are_merged_in_outcome_order() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let script = r#"for a; do last="$a"; done
        echo "<testsuite name=\"$PLUGIN_ENV_NAME\" tests=\"1\"><testcase name=\"t\"/></testsuite>" > "${last#--junitxml=}""#;
    let mut config = config(repo.path(), script);
    let report_dir = repo.path().join("reports");
    config.report_dir = Some(report_dir.clone());
    config.merge_reports = true;
    let pipeline = pipeline(config, &provisioner);

    let result = pipeline
        .run(
            &changes(&["lib/models/resnet/model.py", "lib/models/alexnet/model.py"]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code(), 0);
    let merged = result.merged_report.expect("merged report written");
    assert_eq!(merged, report_dir.join("combined.xml"));

    let combined = fs::read_to_string(merged).unwrap();
    let resnet = combined.find("models__resnet").unwrap();
    let alexnet = combined.find("models__alexnet").unwrap();
    assert!(resnet < alexnet);
}

#[tokio::test]
async fn test_missing_report_does_not_change_exit_code() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new());
    let mut config = config(repo.path(), "exit 0");
    config.report_dir = Some(repo.path().join("reports"));
    config.merge_reports = true;
    let pipeline = pipeline(config, &provisioner);

    let result = pipeline
        .run(&changes(&["lib/models/alexnet/model.py"]), None)
        .await
        .unwrap();
    assert_eq!(result.exit_code(), 0);
    assert!(result.merged_report.is_none());
}

#[tokio::test]
async fn test_base_reuse_keeps_plugins_isolated() {
    let repo = fixture();
    let provisioner = Arc::new(SimulatedProvisioner::new().with_base_reuse(true));
    let script = r#"case "$PLUGIN_ENV_PACKAGES" in host:*) ;; *) exit 7;; esac
    case "$PLUGIN_ENV_NAME:$PLUGIN_ENV_PACKAGES" in models__resnet:*onlyforalexnet*) exit 9;; esac
    exit 0"#;
    let pipeline = pipeline(config(repo.path(), script), &provisioner);

    let result = pipeline
        .run(
            &changes(&["lib/models/alexnet/model.py", "lib/models/resnet/model.py"]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code(), 0, "{:?}", result.verdict);
    assert!(provisioner.live_environments().is_empty());
}
