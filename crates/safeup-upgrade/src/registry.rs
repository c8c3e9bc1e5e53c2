use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use safeup_core::PackageKind;
use semver::Version;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatableQuery {
    pub plugins: bool,
    pub themes: bool,
}

impl UpdatableQuery {
    pub fn all() -> Self {
        Self {
            plugins: true,
            themes: true,
        }
    }

    pub fn includes(&self, kind: PackageKind) -> bool {
        match kind {
            PackageKind::Plugins => self.plugins,
            PackageKind::Themes => self.themes,
        }
    }
}

/// Installed and candidate versions of one package. `published` is only
/// `Some(false)` when the registry explicitly withdrew the package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub available: Option<String>,
    #[serde(default)]
    pub published: Option<bool>,
}

impl PackageInfo {
    pub fn new(version: impl Into<String>, available: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            available: Some(available.into()),
            published: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published != Some(false)
    }
}

pub type UpdatablePackages = BTreeMap<PackageKind, BTreeMap<String, PackageInfo>>;

pub trait PackageRegistry {
    fn updatable(&self, query: UpdatableQuery) -> Result<UpdatablePackages>;
}

/// In-memory registry, used offline and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    packages: UpdatablePackages,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(mut self, kind: PackageKind, slug: &str, info: PackageInfo) -> Self {
        self.packages
            .entry(kind)
            .or_default()
            .insert(slug.to_string(), info);
        self
    }
}

impl PackageRegistry for StaticRegistry {
    fn updatable(&self, query: UpdatableQuery) -> Result<UpdatablePackages> {
        Ok(self
            .packages
            .iter()
            .filter(|(kind, _)| query.includes(**kind))
            .map(|(kind, packages)| (*kind, packages.clone()))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistry;

impl PackageRegistry for NoRegistry {
    fn updatable(&self, _query: UpdatableQuery) -> Result<UpdatablePackages> {
        Err(anyhow!("package registry is not configured"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RemoteListing {
    #[serde(default)]
    plugins: BTreeMap<String, RemotePackage>,
    #[serde(default)]
    themes: BTreeMap<String, RemotePackage>,
}

#[derive(Debug, Deserialize)]
struct RemotePackage {
    version: String,
    #[serde(default)]
    published: Option<bool>,
}

/// Fetches a JSON listing of latest versions and compares it with the
/// versions declared by installed packages under `<root>/user/{plugins,themes}`.
pub struct RemoteRegistry {
    url: String,
    root: PathBuf,
    client: reqwest::blocking::Client,
}

impl RemoteRegistry {
    pub fn new(url: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build package registry HTTP client")?;
        Ok(Self {
            url: url.into(),
            root: root.into(),
            client,
        })
    }

    fn fetch_listing(&self) -> Result<RemoteListing> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .with_context(|| format!("failed to query package registry {}", self.url))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "package registry {} returned HTTP {}",
                self.url,
                response.status()
            );
        }
        let body = response
            .text()
            .with_context(|| format!("failed to read package registry listing from {}", self.url))?;
        serde_json::from_str(&body)
            .with_context(|| format!("failed to decode package registry listing from {}", self.url))
    }
}

impl PackageRegistry for RemoteRegistry {
    fn updatable(&self, query: UpdatableQuery) -> Result<UpdatablePackages> {
        let listing = self.fetch_listing()?;
        let mut updatable = UpdatablePackages::new();
        for (kind, remote) in [
            (PackageKind::Plugins, &listing.plugins),
            (PackageKind::Themes, &listing.themes),
        ] {
            if !query.includes(kind) {
                continue;
            }
            let installed_root = self.root.join("user").join(kind.as_str());
            for (slug, package) in remote {
                let Some(installed) = installed_version(&installed_root.join(slug)) else {
                    continue;
                };
                if !is_newer(&package.version, &installed) {
                    continue;
                }
                updatable.entry(kind).or_default().insert(
                    slug.clone(),
                    PackageInfo {
                        version: Some(installed),
                        available: Some(package.version.clone()),
                        published: package.published,
                    },
                );
            }
        }
        Ok(updatable)
    }
}

/// Version declared in `blueprints.yaml`, if the package is installed and
/// declares one.
pub(crate) fn installed_version(package_dir: &Path) -> Option<String> {
    if !package_dir.is_dir() {
        return None;
    }
    let raw = fs::read_to_string(package_dir.join("blueprints.yaml")).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).ok()?;
    yaml_scalar(value.get("version")?)
}

pub(crate) fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text.clone()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn is_newer(candidate: &str, installed: &str) -> bool {
    let strip = |value: &str| value.trim().trim_start_matches(['v', 'V']).to_string();
    match (Version::parse(&strip(candidate)), Version::parse(&strip(installed))) {
        (Ok(candidate), Ok(installed)) => candidate > installed,
        _ => candidate.trim() != installed.trim(),
    }
}
