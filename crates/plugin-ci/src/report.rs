//! Merging per-target JUnit reports into one combined report.
//!
//! Merge problems are logged and counted, never escalated: the exit code is
//! decided by test outcomes alone.

use crate::error::ReportError;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

static TESTSUITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<testsuite\b(?:[^>]*/>|[^>]*>.*?</testsuite>)").expect("invalid regex")
});

/// Outcome of a merge
#[derive(Debug, Default)]
pub struct MergeSummary {
    /// Artifacts whose suites made it into the combined report.
    pub merged: Vec<PathBuf>,
    /// Artifacts that were skipped.
    pub failures: Vec<ReportError>,
    /// Combined report location, if one was written.
    pub output: Option<PathBuf>,
}

/// Extract the `<testsuite>` elements of one artifact.
pub fn read_suites(path: &Path) -> Result<Vec<String>, ReportError> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ReportError::Missing(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let suites: Vec<String> = TESTSUITE
        .find_iter(&body)
        .map(|m| m.as_str().trim().to_string())
        .collect();
    if suites.is_empty() {
        return Err(ReportError::Corrupt {
            path: path.display().to_string(),
            reason: "no <testsuite> element".to_string(),
        });
    }
    Ok(suites)
}

/// Merge `artifacts` (in order) into `output`.
///
/// Unreadable artifacts are skipped and recorded in the summary. Only a
/// failure to write `output` itself is returned as an error.
pub fn merge_reports(artifacts: &[PathBuf], output: &Path) -> Result<MergeSummary, ReportError> {
    let mut summary = MergeSummary::default();
    let mut suites = Vec::new();

    for artifact in artifacts {
        match read_suites(artifact) {
            Ok(found) => {
                suites.extend(found);
                summary.merged.push(artifact.clone());
            }
            Err(e) => {
                warn!(artifact = %artifact.display(), error = %e, "ReportMergeFailed: skipping artifact");
                summary.failures.push(e);
            }
        }
    }

    if summary.merged.is_empty() {
        warn!(output = %output.display(), "No report artifacts to merge");
        return Ok(summary);
    }

    let mut combined = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    combined.push_str(&format!(
        "<testsuites name=\"plugin-ci\" timestamp=\"{}\">\n",
        Utc::now().format("%Y-%m-%dT%H:%M:%S")
    ));
    for suite in &suites {
        combined.push_str(suite);
        combined.push('\n');
    }
    combined.push_str("</testsuites>\n");

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, combined)?;

    info!(
        output = %output.display(),
        artifacts = summary.merged.len(),
        suites = suites.len(),
        skipped = summary.failures.len(),
        "Merged test reports"
    );
    summary.output = Some(output.to_path_buf());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SUITE_A: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites><testsuite name="pytest" tests="2" failures="0"><testcase classname="test" name="test_a"/><testcase classname="test" name="test_b"></testcase></testsuite></testsuites>"#;

    const SUITE_B: &str = r#"<testsuite name="other" tests="0"/>"#;

    #[test]
    fn test_merge_in_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("models__a.xml");
        let b = dir.path().join("models__b.xml");
        std::fs::write(&a, SUITE_A).unwrap();
        std::fs::write(&b, SUITE_B).unwrap();

        let out = dir.path().join("out").join("combined.xml");
        let summary = merge_reports(&[a, b], &out).unwrap();
        assert_eq!(summary.merged.len(), 2);
        assert!(summary.failures.is_empty());

        let combined = std::fs::read_to_string(&out).unwrap();
        assert!(combined.starts_with("<?xml"));
        assert_eq!(combined.matches("<testsuites").count(), 1);
        let first = combined.find("name=\"pytest\"").unwrap();
        let second = combined.find("name=\"other\"").unwrap();
        assert!(first < second);
        assert!(combined.contains("name=\"test_b\"></testcase></testsuite>"));
    }

    #[test]
    fn test_missing_and_corrupt_artifacts_are_skipped() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.xml");
        let corrupt = dir.path().join("corrupt.xml");
        std::fs::write(&good, SUITE_B).unwrap();
        std::fs::write(&corrupt, "Traceback (most recent call last)").unwrap();
        let missing = dir.path().join("missing.xml");

        let out = dir.path().join("combined.xml");
        let summary = merge_reports(&[missing, corrupt, good], &out).unwrap();
        assert_eq!(summary.merged.len(), 1);
        assert_eq!(summary.failures.len(), 2);
        assert!(matches!(summary.failures[0], ReportError::Missing(_)));
        assert!(matches!(summary.failures[1], ReportError::Corrupt { .. }));
        assert!(out.is_file());
    }

    #[test]
    fn test_nothing_to_merge_writes_nothing() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("combined.xml");
        let summary = merge_reports(&[], &out).unwrap();
        assert!(summary.output.is_none());
        assert!(!out.exists());
    }
}
