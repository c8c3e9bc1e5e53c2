use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Plugins,
    Themes,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plugins => "plugins",
            Self::Themes => "themes",
        }
    }

    pub fn singular(self) -> &'static str {
        match self {
            Self::Plugins => "plugin",
            Self::Themes => "theme",
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    #[serde(rename = "type")]
    pub kind: PackageKind,
    pub current: Option<String>,
    pub available: Option<String>,
}

/// A plugin whose declared constraint on the shared library does not accept
/// the version bundled with the target release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConflict {
    pub declaration: PathBuf,
    pub requires: String,
}

/// First call to a deprecated logger method found in a plugin source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecatedApiUsage {
    /// Relative to the site root.
    pub file: PathBuf,
    pub method: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub plugins_pending: BTreeMap<String, PendingUpdate>,
    pub dependency_conflicts: BTreeMap<String, DependencyConflict>,
    #[serde(default)]
    pub deprecated_api_usages: BTreeMap<String, Vec<DeprecatedApiUsage>>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub is_major_minor_upgrade: bool,
}

impl PreflightReport {
    pub fn has_issues(&self) -> bool {
        !self.plugins_pending.is_empty()
            || !self.dependency_conflicts.is_empty()
            || !self.deprecated_api_usages.is_empty()
            || !self.warnings.is_empty()
    }
}
