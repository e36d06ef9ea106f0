//! Plugin kinds and their on-disk naming.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The closed set of plugin kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Data,
    Metric,
    Benchmark,
    Model,
}

impl PluginKind {
    /// All kinds, in the order plugin directories are scanned.
    pub const ALL: [PluginKind; 4] = [
        PluginKind::Data,
        PluginKind::Metric,
        PluginKind::Benchmark,
        PluginKind::Model,
    ];

    /// Directory holding plugins of this kind (`<library>/<dir>/<identifier>/`).
    pub fn dir_name(&self) -> &'static str {
        match self {
            PluginKind::Data => "data",
            PluginKind::Metric => "metrics",
            PluginKind::Benchmark => "benchmarks",
            PluginKind::Model => "models",
        }
    }

    /// Singular name, used for helper directories and registries.
    pub fn singular(&self) -> &'static str {
        match self {
            PluginKind::Data => "data",
            PluginKind::Metric => "metric",
            PluginKind::Benchmark => "benchmark",
            PluginKind::Model => "model",
        }
    }

    /// Shared helper directory, e.g. `model_helpers`.
    pub fn helpers_dir(&self) -> String {
        format!("{}_helpers", self.singular())
    }

    /// Registry variable plugins register under, e.g. `model_registry`.
    pub fn registry_name(&self) -> String {
        format!("{}_registry", self.singular())
    }

    /// Match a kind directory name (`models`, `data`, ...).
    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dir_name() == name)
    }

    /// Match a helper directory name (`model_helpers`, ...).
    pub fn from_helpers_dir(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.helpers_dir() == name)
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.singular())
    }
}

impl FromStr for PluginKind {
    type Err = String;

    /// Accepts both singular and plural spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.singular() == s || k.dir_name() == s)
            .ok_or_else(|| format!("unknown plugin kind: {} (expected data, metric, benchmark or model)", s))
    }
}
