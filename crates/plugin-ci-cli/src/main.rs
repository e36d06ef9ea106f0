//! plugin-ci - selective plugin test orchestration CLI
//!
//! ## Commands
//!
//! - `test`: classify a change set, test the affected plugins (or the full
//!   suite) and exit with the aggregate exit code
//! - `changes`: print the change analysis as JSON
//! - `score`: score a model against a benchmark

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use plugin_ci::{
    analyze, init_tracing, ChangeSet, FailurePolicy, InstallPreference, OutcomeStatus,
    PipelineConfig, PluginKind, PluginPipeline, Scorer,
};
use plugin_env::{CommandProvisioner, EnvironmentProvisioner, SimulatedProvisioner, ToolchainProfile};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "plugin-ci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Selective plugin test orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (JSON); flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct LibraryArgs {
    /// Library namespace directory (e.g. brainscore_vision)
    #[arg(long)]
    library: Option<String>,

    /// Repository root the changed paths are relative to
    #[arg(long)]
    repo_root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ContextArgs {
    /// Resource-restricted runner: skip GPU, memory-intense and slow tests
    #[arg(long, env = "PLUGIN_CI_RESTRICTED", value_parser = BoolishValueParser::new(), default_value_t = false)]
    restricted: bool,

    /// Private resources are accessible
    #[arg(long, env = "PLUGIN_CI_PRIVATE_ACCESS", value_parser = BoolishValueParser::new(), default_value_t = false)]
    private_access: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Test the plugins affected by a change set
    Test {
        #[command(flatten)]
        library: LibraryArgs,

        #[command(flatten)]
        context: ContextArgs,

        /// Changed paths, newline or space separated (empty runs the full suite)
        #[arg(long, default_value = "")]
        changed: String,

        /// Run only tests whose name contains this string
        #[arg(long)]
        test: Option<String>,

        /// Only test plugins of this kind
        #[arg(long)]
        kind: Option<PluginKind>,

        /// Write the merged report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Directory for per-target report artifacts
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Merge per-target reports into one
        #[arg(long, env = "PLUGIN_CI_MERGE_REPORTS", value_parser = BoolishValueParser::new(), default_value_t = false)]
        merge_reports: bool,

        /// Maximum number of plugins tested at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Package manager preset
        #[arg(long, value_parser = ["conda", "venv"])]
        toolchain: Option<String>,

        /// Skip plugins not yet started once one fails to provision
        #[arg(long)]
        abort_on_provision_failure: bool,

        /// Install the host library per plugin instead of cloning a base environment
        #[arg(long)]
        no_reuse_base: bool,

        /// Use in-memory environments (no package manager)
        #[arg(long)]
        simulate: bool,
    },

    /// Print the change analysis as JSON
    Changes {
        #[command(flatten)]
        library: LibraryArgs,

        /// Changed paths, newline or space separated
        #[arg(long, default_value = "")]
        changed: String,
    },

    /// Score a model on a benchmark
    Score {
        #[command(flatten)]
        library: LibraryArgs,

        /// Registered model identifier
        #[arg(long)]
        model: String,

        /// Registered benchmark identifier
        #[arg(long)]
        benchmark: String,

        /// Dependency install preference (yes, no, newenv)
        #[arg(long, env = "PLUGIN_CI_INSTALL_DEPENDENCIES")]
        install_dependencies: Option<InstallPreference>,

        /// Package manager preset
        #[arg(long, value_parser = ["conda", "venv"])]
        toolchain: Option<String>,

        /// Use in-memory environments (no package manager)
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let base = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let code = match cli.command {
        Commands::Test {
            library,
            context,
            changed,
            test,
            kind,
            report,
            report_dir,
            merge_reports,
            concurrency,
            toolchain,
            abort_on_provision_failure,
            no_reuse_base,
            simulate,
        } => {
            let mut config = apply_library(base, library);
            config.context.restricted |= context.restricted;
            config.context.private_access |= context.private_access;
            config.kind_filter = kind.or(config.kind_filter);
            config.report_dir = report_dir.or(config.report_dir);
            if report.is_some() {
                config.merged_report = report;
                config.merge_reports = true;
            }
            config.merge_reports |= merge_reports;
            if config.merge_reports && config.report_dir.is_none() {
                config.report_dir = Some(config.repo_root.join("plugin-ci-reports"));
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(toolchain) = toolchain {
                config.toolchain = toolchain;
            }
            if abort_on_provision_failure {
                config.failure_policy = FailurePolicy::AbortOnProvisionFailure;
            }
            if no_reuse_base {
                config.reuse_base = false;
            }
            cmd_test(config, &changed, test.as_deref(), simulate).await?
        }
        Commands::Changes { library, changed } => {
            cmd_changes(apply_library(base, library), &changed)?
        }
        Commands::Score {
            library,
            model,
            benchmark,
            install_dependencies,
            toolchain,
            simulate,
        } => {
            let mut config = apply_library(base, library);
            if let Some(preference) = install_dependencies {
                config.install_preference = preference;
            }
            if let Some(toolchain) = toolchain {
                config.toolchain = toolchain;
            }
            cmd_score(config, &model, &benchmark, simulate).await?
        }
    };

    std::process::exit(code);
}

fn apply_library(mut config: PipelineConfig, args: LibraryArgs) -> PipelineConfig {
    if let Some(library) = args.library {
        config.library = library;
    }
    if let Some(repo_root) = args.repo_root {
        config.repo_root = repo_root;
    }
    config
}

fn build_provisioner(config: &PipelineConfig, simulate: bool) -> Result<Arc<dyn EnvironmentProvisioner>> {
    if simulate {
        return Ok(Arc::new(SimulatedProvisioner::new().with_base_reuse(config.reuse_base)));
    }

    let profile = ToolchainProfile::preset(&config.toolchain)
        .with_context(|| format!("Unknown toolchain: {}", config.toolchain))?;
    let mut provisioner = CommandProvisioner::new(profile, config.envs_dir())
        .with_python_series(config.python_series.clone())
        .with_base_reuse(config.reuse_base);
    if let Some(timeout) = config.install_timeout() {
        provisioner = provisioner.with_install_timeout(timeout);
    }
    Ok(Arc::new(provisioner))
}

async fn cmd_test(config: PipelineConfig, changed: &str, test: Option<&str>, simulate: bool) -> Result<i32> {
    let change_set = ChangeSet::parse(changed);
    let provisioner = build_provisioner(&config, simulate)?;
    let pipeline = PluginPipeline::new(config, provisioner).context("Invalid pipeline configuration")?;

    println!("Library: {}", pipeline.config().library);
    println!("Changed files: {}", change_set.len());
    println!();

    let result = pipeline
        .run(&change_set, test)
        .await
        .context("Plugin test pipeline failed to run")?;

    println!("Run ID: {}", result.run_id);
    println!(
        "Mode: {}",
        if result.mode.is_plugin_only() { "plugin-only" } else { "full suite" }
    );
    println!(
        "Status: {}",
        if result.verdict.passed() { "✓ PASSED" } else { "✗ FAILED" }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for outcome in &result.verdict.outcomes {
        let mark = match (outcome.passed(), outcome.status) {
            (true, OutcomeStatus::NoTests) => "-",
            (true, _) => "✓",
            (false, _) => "✗",
        };
        println!(
            "  {} {} ({}ms, exit code: {})",
            mark, outcome.target, outcome.duration_ms, outcome.exit_code
        );
        if let Some(diagnostic) = outcome.diagnostic.as_deref().filter(|_| !outcome.passed()) {
            println!("      {}", diagnostic);
        }
        if let Some(warning) = &outcome.teardown_warning {
            println!("      teardown: {}", warning);
        }
    }
    for target in &result.verdict.skipped {
        println!("  ○ {} (skipped)", target);
    }
    if let Some(report) = &result.merged_report {
        println!();
        println!("Report: {}", report.display());
    }

    println!();
    println!("{}", result.verdict.message);
    Ok(result.exit_code())
}

fn cmd_changes(config: PipelineConfig, changed: &str) -> Result<i32> {
    config.validate().context("Invalid configuration")?;
    let report = analyze(&ChangeSet::parse(changed), &config.library, &config.special_files);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

async fn cmd_score(config: PipelineConfig, model: &str, benchmark: &str, simulate: bool) -> Result<i32> {
    let provisioner = build_provisioner(&config, simulate)?;
    let scorer = Scorer::new(config, provisioner).context("Invalid scoring configuration")?;
    let score = scorer
        .score(model, benchmark)
        .await
        .with_context(|| format!("Scoring {} on {} failed", model, benchmark))?;
    info!(model, benchmark, score = score.value, "Scoring complete");
    println!("{}", score.value);
    Ok(score.exit_code)
}
