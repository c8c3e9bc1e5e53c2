use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestOperation {
    #[default]
    Upgrade,
    Snapshot,
}

impl ManifestOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub version: Option<String>,
    pub name: String,
}

/// Record of one promotion (or manual snapshot). Append-only apart from
/// `rolled_back_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeManifest {
    pub id: String,
    pub created_at: u64,
    pub source_version: String,
    pub target_version: String,
    #[serde(default, alias = "php_version")]
    pub runtime_version: String,
    #[serde(default)]
    pub package_path: Option<PathBuf>,
    pub backup_path: PathBuf,
    #[serde(default)]
    pub ignored: Vec<String>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSnapshot>,
    #[serde(default)]
    pub operation: ManifestOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<u64>,
}

impl UpgradeManifest {
    pub fn from_json_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self =
            serde_json::from_str(input).context("failed to parse upgrade manifest")?;
        if manifest.id.trim().is_empty() {
            return Err(anyhow!("upgrade manifest id must not be empty"));
        }
        Ok(manifest)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self)
            .with_context(|| format!("failed to serialize upgrade manifest '{}'", self.id))
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back_at.is_some()
    }
}
