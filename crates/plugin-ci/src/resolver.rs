//! Plugin resolution: from (kind, identifier) to an on-disk descriptor.

use crate::classifier::PluginKey;
use crate::error::{CiError, Result};
use crate::kind::PluginKind;
use plugin_env::{ProvisionRequest, ENVIRONMENT_SPEC_FILE, REQUIREMENTS_FILE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Shared tests run against every plugin of a kind, before its own tests
pub const GENERIC_TEST_FILE: &str = "generic_plugin_tests.py";

/// Module holding a plugin's registrations
pub const REGISTRATION_FILE: &str = "__init__.py";

static TEST_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^test.*\.py$").expect("invalid regex"));

/// A resolved plugin. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub kind: PluginKind,
    pub identifier: String,
    pub directory: PathBuf,
    pub has_requirements: bool,
    pub has_environment_spec: bool,
    pub has_test_file: bool,
    /// Test files in the plugin directory, sorted by name
    pub test_files: Vec<PathBuf>,
    /// Generic tests for this kind, if the library defines them
    pub generic_test: Option<PathBuf>,
}

impl PluginDescriptor {
    pub fn key(&self) -> PluginKey {
        PluginKey::new(self.kind, self.identifier.clone())
    }

    pub fn requirements_path(&self) -> Option<PathBuf> {
        self.has_requirements
            .then(|| self.directory.join(REQUIREMENTS_FILE))
    }

    pub fn environment_spec_path(&self) -> Option<PathBuf> {
        self.has_environment_spec
            .then(|| self.directory.join(ENVIRONMENT_SPEC_FILE))
    }

    /// Append this plugin's manifests to `request`, environment spec first.
    pub fn add_manifests(&self, mut request: ProvisionRequest) -> ProvisionRequest {
        if let Some(spec) = self.environment_spec_path() {
            request = request.with_environment_spec(spec);
        }
        if let Some(requirements) = self.requirements_path() {
            request = request.with_requirements(requirements);
        }
        request
    }

    /// Environment request for testing this plugin on top of `host_library`.
    pub fn provision_request(&self, host_library: &Path) -> ProvisionRequest {
        self.add_manifests(ProvisionRequest::new(self.key().env_name(), host_library))
    }

    /// Test paths in execution order: generic tests first
    pub fn test_paths(&self) -> Vec<PathBuf> {
        self.generic_test
            .iter()
            .chain(self.test_files.iter())
            .cloned()
            .collect()
    }
}

/// Resolves plugins below a library root (`<repo>/<library>`).
#[derive(Debug, Clone)]
pub struct PluginResolver {
    library_root: PathBuf,
}

impl PluginResolver {
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
        }
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    /// Resolve `(kind, identifier)` to its descriptor.
    ///
    /// Matching compares directory entry names exactly, so the result does
    /// not depend on whether the filesystem folds case.
    pub fn resolve(&self, kind: PluginKind, identifier: &str) -> Result<PluginDescriptor> {
        let not_found = || CiError::PluginNotFound {
            kind,
            identifier: identifier.to_string(),
        };

        let kind_dir = self.library_root.join(kind.dir_name());
        let entries = match std::fs::read_dir(&kind_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let mut directory = None;
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_str() == Some(identifier) && entry.file_type()?.is_dir() {
                directory = Some(entry.path());
                break;
            }
        }
        let directory = directory.ok_or_else(not_found)?;

        let mut test_files = Vec::new();
        let mut has_requirements = false;
        let mut has_environment_spec = false;
        for entry in std::fs::read_dir(&directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match name {
                REQUIREMENTS_FILE => has_requirements = true,
                ENVIRONMENT_SPEC_FILE => has_environment_spec = true,
                _ if TEST_FILE.is_match(name) => test_files.push(entry.path()),
                _ => {}
            }
        }
        test_files.sort();

        let generic = self
            .library_root
            .join(kind.helpers_dir())
            .join(GENERIC_TEST_FILE);
        let generic_test = generic.is_file().then_some(generic);

        let descriptor = PluginDescriptor {
            kind,
            identifier: identifier.to_string(),
            directory,
            has_requirements,
            has_environment_spec,
            has_test_file: !test_files.is_empty(),
            test_files,
            generic_test,
        };
        debug!(
            plugin = %descriptor.key(),
            requirements = descriptor.has_requirements,
            environment_spec = descriptor.has_environment_spec,
            tests = descriptor.test_files.len(),
            "Resolved plugin"
        );
        Ok(descriptor)
    }

    pub fn resolve_key(&self, key: &PluginKey) -> Result<PluginDescriptor> {
        self.resolve(key.kind, &key.identifier)
    }

    /// All plugin directories of `kind`, sorted; hidden and private entries skipped.
    pub fn discover(&self, kind: PluginKind) -> Result<Vec<PluginKey>> {
        let kind_dir = self.library_root.join(kind.dir_name());
        let entries = match std::fs::read_dir(&kind_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut identifiers = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && !name.starts_with('_') {
                    identifiers.push(name.to_string());
                }
            }
        }
        identifiers.sort();

        Ok(identifiers
            .into_iter()
            .map(|id| PluginKey::new(kind, id))
            .collect())
    }

    /// Identifiers a plugin registers in its `__init__.py`, in file order.
    ///
    /// Recognizes `<singular>_registry['id']` and `<singular>_registry["id"]`.
    pub fn registered_identifiers(&self, descriptor: &PluginDescriptor) -> Result<Vec<String>> {
        let init = descriptor.directory.join(REGISTRATION_FILE);
        let source = match std::fs::read_to_string(&init) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let pattern = format!(
            r#"{}\[\s*(?:'([^']+)'|"([^"]+)")\s*\]"#,
            regex::escape(&descriptor.kind.registry_name())
        );
        let registry = Regex::new(&pattern)
            .map_err(|e| CiError::InvalidConfig(format!("registry pattern: {}", e)))?;

        let mut identifiers = Vec::new();
        for caps in registry.captures_iter(&source) {
            if let Some(id) = caps.get(1).or_else(|| caps.get(2)) {
                let id = id.as_str().to_string();
                if !identifiers.contains(&id) {
                    identifiers.push(id);
                }
            }
        }
        Ok(identifiers)
    }

    /// Find the single plugin of `kind` that registers `registered_id`.
    pub fn locate_registered(&self, kind: PluginKind, registered_id: &str) -> Result<PluginDescriptor> {
        let mut matches = Vec::new();
        for key in self.discover(kind)? {
            let descriptor = self.resolve_key(&key)?;
            if self
                .registered_identifiers(&descriptor)?
                .iter()
                .any(|id| id == registered_id)
            {
                matches.push(descriptor);
            }
        }

        match matches.len() {
            0 => Err(CiError::PluginNotFound {
                kind,
                identifier: registered_id.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(CiError::AmbiguousRegistration {
                kind,
                identifier: registered_id.to_string(),
                directories: matches.into_iter().map(|d| d.identifier).collect(),
            }),
        }
    }
}
