//! Test selection and the test harness command line.

use crate::config::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tags excluded on resource-restricted runners
pub const RESTRICTED_TAGS: [&str; 4] = ["requires_gpu", "memory_intense", "slow", "travis_slow"];

/// Tag excluded when private resources are unavailable
pub const PRIVATE_ACCESS_TAG: &str = "private_access";

/// A conjunction of excluded tags, rendered as `not a and not b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagExpression {
    excluded: Vec<String>,
}

impl TagExpression {
    pub fn excluding<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Tags that cannot run in `context`; `None` when everything may run.
    pub fn from_context(context: &ExecutionContext) -> Option<Self> {
        let mut excluded: Vec<String> = Vec::new();
        if context.restricted {
            excluded.extend(RESTRICTED_TAGS.iter().map(|t| t.to_string()));
        }
        if !context.private_access {
            excluded.push(PRIVATE_ACCESS_TAG.to_string());
        }
        (!excluded.is_empty()).then_some(Self { excluded })
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn render(&self) -> String {
        self.excluded
            .iter()
            .map(|t| format!("not {}", t))
            .collect::<Vec<_>>()
            .join(" and ")
    }
}

impl std::fmt::Display for TagExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Which tests of a target to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSelection {
    All,
    /// Tests whose name contains the given substring.
    Named(String),
    Tags(TagExpression),
}

impl TestSelection {
    /// Named test if given, otherwise whatever the context allows.
    pub fn for_context(test: Option<&str>, context: &ExecutionContext) -> Self {
        match test {
            Some(name) if !name.trim().is_empty() => TestSelection::Named(name.trim().to_string()),
            _ => TestSelection::from_context(context),
        }
    }

    pub fn from_context(context: &ExecutionContext) -> Self {
        TagExpression::from_context(context)
            .map(TestSelection::Tags)
            .unwrap_or(TestSelection::All)
    }

    /// Whether "no tests collected" counts as a pass. A specifically
    /// requested test that does not exist is a failure.
    pub fn accepts_no_tests(&self) -> bool {
        !matches!(self, TestSelection::Named(_))
    }
}

/// Builds test command lines (pytest-compatible by default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestHarness {
    /// Program and leading arguments.
    pub program: Vec<String>,
    /// Flag selecting tests by name substring.
    pub name_flag: String,
    /// Flag selecting tests by tag expression.
    pub tag_flag: String,
    /// Prefix of the structured report argument.
    pub report_flag: String,
    /// Flag passing the plugin directory to generic tests.
    pub plugin_directory_flag: String,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self {
            program: vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
            name_flag: "-k".to_string(),
            tag_flag: "-m".to_string(),
            report_flag: "--junitxml=".to_string(),
            plugin_directory_flag: "--plugin_directory".to_string(),
        }
    }
}

impl TestHarness {
    /// Harness running an arbitrary command; used with test doubles.
    pub fn command(program: Vec<String>) -> Self {
        Self {
            program,
            ..Self::default()
        }
    }

    /// Command line for one target run.
    pub fn argv(
        &self,
        test_paths: &[PathBuf],
        selection: &TestSelection,
        report: Option<&Path>,
        plugin_directory: Option<&Path>,
    ) -> Vec<String> {
        let mut argv = self.program.clone();
        argv.extend(test_paths.iter().map(|p| p.to_string_lossy().to_string()));

        match selection {
            TestSelection::All => {}
            TestSelection::Named(name) => {
                argv.push(self.name_flag.clone());
                argv.push(name.clone());
            }
            TestSelection::Tags(expr) => {
                argv.push(self.tag_flag.clone());
                argv.push(expr.render());
            }
        }

        if let Some(report) = report {
            argv.push(format!("{}{}", self.report_flag, report.display()));
        }
        if let Some(dir) = plugin_directory {
            argv.push(self.plugin_directory_flag.clone());
            argv.push(dir.to_string_lossy().to_string());
        }
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_without_private_access() {
        let ctx = ExecutionContext {
            restricted: true,
            private_access: false,
        };
        let expr = TagExpression::from_context(&ctx).unwrap();
        assert_eq!(
            expr.render(),
            "not requires_gpu and not memory_intense and not slow and not travis_slow and not private_access"
        );
    }

    #[test]
    fn test_unrestricted_with_private_access_selects_all() {
        let ctx = ExecutionContext {
            restricted: false,
            private_access: true,
        };
        assert!(TagExpression::from_context(&ctx).is_none());
        assert_eq!(TestSelection::from_context(&ctx), TestSelection::All);
    }

    #[test]
    fn test_named_test_overrides_context() {
        let ctx = ExecutionContext::default();
        let sel = TestSelection::for_context(Some("test_exact"), &ctx);
        assert_eq!(sel, TestSelection::Named("test_exact".to_string()));
        assert!(!sel.accepts_no_tests());

        let sel = TestSelection::for_context(Some("  "), &ctx);
        assert!(matches!(sel, TestSelection::Tags(_)));
        assert!(sel.accepts_no_tests());
    }

    #[test]
    fn test_argv_layout() {
        let harness = TestHarness::default();
        let argv = harness.argv(
            &[
                PathBuf::from("lib/model_helpers/generic_plugin_tests.py"),
                PathBuf::from("lib/models/alexnet/test.py"),
            ],
            &TestSelection::Named("test_layers".to_string()),
            Some(Path::new("reports/models__alexnet.xml")),
            Some(Path::new("lib/models/alexnet")),
        );
        assert_eq!(
            argv,
            vec![
                "python",
                "-m",
                "pytest",
                "lib/model_helpers/generic_plugin_tests.py",
                "lib/models/alexnet/test.py",
                "-k",
                "test_layers",
                "--junitxml=reports/models__alexnet.xml",
                "--plugin_directory",
                "lib/models/alexnet",
            ]
        );
    }

    #[test]
    fn test_argv_with_tags() {
        let harness = TestHarness::default();
        let argv = harness.argv(
            &[PathBuf::from("tests")],
            &TestSelection::Tags(TagExpression::excluding(["slow"])),
            None,
            None,
        );
        assert_eq!(argv[argv.len() - 2..], ["-m".to_string(), "not slow".to_string()]);
    }
}
