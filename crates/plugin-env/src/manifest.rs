//! Plugin dependency manifests
//!
//! Parses and validates the two manifest kinds a plugin may ship:
//! an environment spec (`environment.yml`) and a plain requirements list
//! (`requirements.txt`).

use crate::error::EnvError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use tracing::debug;

/// Well-known filename of a plugin's environment spec
pub const ENVIRONMENT_SPEC_FILE: &str = "environment.yml";

/// Well-known filename of a plugin's requirements list
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Python series environment specs may pin when none is configured
pub const DEFAULT_PYTHON_SERIES: &str = "3.11";

/// Parsed contents of an environment spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Package-manager dependencies, as written
    pub dependencies: Vec<String>,
    /// Nested `pip:` dependencies, as written
    pub pip: Vec<String>,
}

impl EnvironmentSpec {
    /// All declared package names (lower-cased), package-manager deps first
    pub fn package_names(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .chain(self.pip.iter())
            .filter_map(|d| package_name(d))
            .collect()
    }

    /// The pinned python version, if the spec pins one
    pub fn python_pins(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter_map(|d| {
                let d = d.trim();
                d.strip_prefix("python==")
                    .or_else(|| d.strip_prefix("python="))
            })
            .collect()
    }
}

/// Parse and validate an environment spec file.
///
/// Rules:
/// - the spec must not set `name` (the orchestrator assigns env names)
/// - at most one `python=` pin
/// - a pin, if present, must start with `python_series`
pub fn load_environment_spec(path: &Path, python_series: &str) -> Result<EnvironmentSpec> {
    let content = std::fs::read_to_string(path)?;
    let spec = parse_environment_spec(&content).map_err(|reason| invalid(path, reason))?;

    let pins = spec.python_pins();
    match pins.as_slice() {
        [] => {}
        [version] => {
            if !version.starts_with(python_series) {
                return Err(invalid(
                    path,
                    format!("python version {} is not in series {}", version, python_series),
                ));
            }
        }
        _ => return Err(invalid(path, "multiple python versions specified".to_string())),
    }

    debug!(
        path = %path.display(),
        dependencies = spec.dependencies.len(),
        pip = spec.pip.len(),
        "Validated environment spec"
    );
    Ok(spec)
}

fn invalid(path: &Path, reason: String) -> EnvError {
    EnvError::InvalidEnvironmentSpec {
        path: path.display().to_string(),
        reason,
    }
}

fn parse_environment_spec(content: &str) -> std::result::Result<EnvironmentSpec, String> {
    let value: Value = serde_yaml::from_str(content).map_err(|e| e.to_string())?;

    let mapping = match value {
        Value::Mapping(m) => m,
        Value::Null => return Ok(EnvironmentSpec::default()),
        _ => return Err("top level must be a mapping".to_string()),
    };

    if mapping.contains_key(Value::from("name")) {
        return Err("environment spec must not specify 'name'".to_string());
    }

    let mut spec = EnvironmentSpec::default();
    let Some(deps) = mapping.get(Value::from("dependencies")) else {
        return Ok(spec);
    };
    let Value::Sequence(deps) = deps else {
        return Err("'dependencies' must be a list".to_string());
    };

    for dep in deps {
        match dep {
            Value::String(s) => spec.dependencies.push(s.clone()),
            Value::Mapping(nested) => {
                if let Some(Value::Sequence(pip)) = nested.get(Value::from("pip")) {
                    spec.pip
                        .extend(pip.iter().filter_map(|p| p.as_str().map(str::to_string)));
                }
            }
            other => return Err(format!("unsupported dependency entry: {:?}", other)),
        }
    }

    Ok(spec)
}

/// Read a requirements list, skipping blanks, comments and option lines
pub fn load_requirements(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_requirements(&content))
}

fn parse_requirements(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .filter_map(package_name)
        .collect()
}

/// Extract the bare, lower-cased package name from a requirement specifier
pub fn package_name(spec: &str) -> Option<String> {
    let end = spec
        .find(|c: char| "=<>!~;[ @".contains(c))
        .unwrap_or(spec.len());
    let name = spec[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}
