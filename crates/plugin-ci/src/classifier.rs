//! Change classification: which plugins does a change set touch?
//!
//! A changed path `<library>/<kind dir>/<identifier>/...` belongs to plugin
//! `(kind, identifier)`. Everything else is core. A change set runs in
//! plugin-only mode when it is non-empty and every path belongs to a plugin;
//! any doubt falls back to the full suite.

use crate::kind::PluginKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered changed paths of one change request, relative to the repo root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    paths: Vec<String>,
}

impl ChangeSet {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths
            .into_iter()
            .map(Into::into)
            .map(|p: String| {
                let p = p.trim();
                p.strip_prefix("./").unwrap_or(p).to_string()
            })
            .filter(|p| !p.is_empty())
            .collect();
        Self { paths }
    }

    /// Parse newline- or space-delimited paths (e.g. `git diff --name-only`).
    pub fn parse(delimited: &str) -> Self {
        Self::new(delimited.split_whitespace())
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Identity of a plugin: unique within a library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    pub kind: PluginKind,
    pub identifier: String,
}

impl PluginKey {
    pub fn new(kind: PluginKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
        }
    }

    /// Environment name for this plugin, e.g. `models__alexnet`.
    pub fn env_name(&self) -> String {
        format!("{}__{}", self.kind.dir_name(), self.identifier)
    }
}

impl std::fmt::Display for PluginKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.dir_name(), self.identifier)
    }
}

/// Affected plugins in discovery order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedPluginSet {
    keys: Vec<PluginKey>,
}

impl AffectedPluginSet {
    /// Insert a key; returns false if it was already present.
    pub fn insert(&mut self, key: PluginKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn contains(&self, key: &PluginKey) -> bool {
        self.keys.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keep only plugins of `kind`, preserving order.
    pub fn retain_kind(&mut self, kind: PluginKind) {
        self.keys.retain(|k| k.kind == kind);
    }

    pub fn into_vec(self) -> Vec<PluginKey> {
        self.keys
    }
}

impl FromIterator<PluginKey> for AffectedPluginSet {
    fn from_iter<T: IntoIterator<Item = PluginKey>>(iter: T) -> Self {
        let mut set = AffectedPluginSet::default();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

/// What a change request requires to be tested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "plugins", rename_all = "snake_case")]
pub enum RunMode {
    /// Core code changed (or provenance is unclear): run the whole suite.
    FullSuite,
    /// Only plugin directories changed: test just those plugins.
    PluginOnly(AffectedPluginSet),
}

impl RunMode {
    pub fn is_plugin_only(&self) -> bool {
        matches!(self, RunMode::PluginOnly(_))
    }
}

/// Classification of a single changed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathClass {
    /// Inside a plugin directory.
    Plugin(PluginKey),
    /// Outside any plugin, but shared by plugins of these kinds
    /// (helper directories, files at a kind root, configured special files).
    PluginRelated(Vec<PluginKind>),
    /// Core code.
    Core,
    /// Unparseable path; treated as core.
    Ambiguous(String),
}

impl PathClass {
    pub fn plugin(&self) -> Option<&PluginKey> {
        match self {
            PathClass::Plugin(key) => Some(key),
            _ => None,
        }
    }
}

/// Classify one path relative to `library`.
///
/// `special_files` are repo-relative paths whose change affects every plugin
/// kind (e.g. the model interface definition).
pub fn classify_path(path: &str, library: &str, special_files: &[String]) -> PathClass {
    if path.starts_with('/') || path.contains('\\') {
        return PathClass::Ambiguous(format!("{}: not a repository-relative path", path));
    }
    if path.split('/').any(|segment| segment == "..") {
        return PathClass::Ambiguous(format!("{}: contains parent-directory segment", path));
    }
    if special_files.iter().any(|f| f == path) {
        return PathClass::PluginRelated(PluginKind::ALL.to_vec());
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 2 || parts[0] != library {
        return PathClass::Core;
    }

    if let Some(kind) = PluginKind::from_helpers_dir(parts[1]) {
        return PathClass::PluginRelated(vec![kind]);
    }

    let Some(kind) = PluginKind::from_dir_name(parts[1]) else {
        return PathClass::Core;
    };

    // `<library>/<kind>/<file>` sits at the kind root: no identifier segment
    if parts.len() < 4 || parts[2].is_empty() {
        return PathClass::PluginRelated(vec![kind]);
    }

    let identifier = parts[2];
    if identifier.starts_with('.') || identifier.starts_with('_') {
        return PathClass::Ambiguous(format!("{}: '{}' is not a plugin identifier", path, identifier));
    }

    PathClass::Plugin(PluginKey::new(kind, identifier))
}

/// Decide the run mode for a change set. Pure.
///
/// `PluginOnly` requires a non-empty change set in which every path falls
/// under some plugin directory. An empty change set runs the full suite.
pub fn classify(change_set: &ChangeSet, library: &str) -> RunMode {
    let mut affected = AffectedPluginSet::default();

    for path in change_set.paths() {
        match classify_path(path, library, &[]) {
            PathClass::Plugin(key) => {
                affected.insert(key);
            }
            _ => return RunMode::FullSuite,
        }
    }

    if affected.is_empty() {
        RunMode::FullSuite
    } else {
        RunMode::PluginOnly(affected)
    }
}

/// Detailed change analysis, as printed by the `changes` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    /// Any plugin or plugin-related file changed.
    pub modifies_plugins: bool,
    /// Only plugin files changed (the change qualifies for plugin-only testing).
    pub plugin_only: bool,
    /// Changed plugin identifiers per kind directory, discovery order.
    pub changed_plugins: BTreeMap<String, Vec<String>>,
    /// Kinds whose every plugin should be re-tested.
    pub test_all_kinds: Vec<PluginKind>,
    /// Paths treated as core.
    pub core_paths: Vec<String>,
    /// Paths that could not be parsed (also counted as core).
    pub ambiguous_paths: Vec<String>,
}

/// Analyze a change set in more depth than [`classify`].
pub fn analyze(change_set: &ChangeSet, library: &str, special_files: &[String]) -> ChangeReport {
    let mut changed_plugins: BTreeMap<String, Vec<String>> = PluginKind::ALL
        .iter()
        .map(|k| (k.dir_name().to_string(), Vec::new()))
        .collect();
    let mut related_kinds: Vec<PluginKind> = Vec::new();
    let mut core_paths = Vec::new();
    let mut ambiguous_paths = Vec::new();
    let mut plugin_files = 0usize;

    for path in change_set.paths() {
        match classify_path(path, library, special_files) {
            PathClass::Plugin(key) => {
                plugin_files += 1;
                let ids = changed_plugins
                    .entry(key.kind.dir_name().to_string())
                    .or_default();
                if !ids.contains(&key.identifier) {
                    ids.push(key.identifier);
                }
            }
            PathClass::PluginRelated(kinds) => {
                related_kinds.extend(kinds);
                core_paths.push(path.clone());
            }
            PathClass::Core => core_paths.push(path.clone()),
            PathClass::Ambiguous(reason) => {
                ambiguous_paths.push(reason);
                core_paths.push(path.clone());
            }
        }
    }

    // Metric and data changes feed benchmarks
    if related_kinds
        .iter()
        .any(|k| matches!(k, PluginKind::Metric | PluginKind::Data))
    {
        related_kinds.push(PluginKind::Benchmark);
    }
    let test_all_kinds: Vec<PluginKind> = PluginKind::ALL
        .into_iter()
        .filter(|k| related_kinds.contains(k))
        .collect();

    ChangeReport {
        modifies_plugins: plugin_files > 0 || !test_all_kinds.is_empty(),
        plugin_only: plugin_files > 0 && core_paths.is_empty(),
        changed_plugins,
        test_all_kinds,
        core_paths,
        ambiguous_paths,
    }
}
