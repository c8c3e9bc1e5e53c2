use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use safeup_core::PluginSnapshot;
use tracing::debug;

use crate::fs_utils::top_level_entries;
use crate::registry::yaml_scalar;
use crate::{Filesystem, UpgradeError};

const DOTFILE_SKIP: [&str; 2] = [".git", ".DS_Store"];
const EMPTY_ON_HYDRATE: [&str; 2] = ["cache", "tmp"];

/// Normalizes a caller-supplied ignore list, falling back to `defaults`
/// when it is empty, and refuses lists that would let the package replace
/// user data.
pub(crate) fn effective_ignored(
    requested: &[String],
    defaults: &[String],
) -> Result<Vec<String>, UpgradeError> {
    let source = if requested.iter().any(|path| !path.trim().is_empty()) {
        requested
    } else {
        defaults
    };

    let mut ignored: Vec<String> = Vec::new();
    for path in source {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(UpgradeError::InvalidArgument(format!(
                "ignored path must stay inside the live root: {path}"
            )));
        }
        if !ignored.iter().any(|existing| existing == trimmed) {
            ignored.push(trimmed.to_string());
        }
    }

    if !ignored.iter().any(|path| path == "user") {
        return Err(UpgradeError::SafetyViolation(
            "user directory is not in the ignored directories list".to_string(),
        ));
    }
    Ok(ignored)
}

/// Copies the extracted package into the stage and returns its top-level
/// entries.
pub(crate) fn stage_package(
    filesystem: &dyn Filesystem,
    extracted: &Path,
    package_dir: &Path,
) -> Result<Vec<String>, UpgradeError> {
    filesystem.copy_tree(extracted, package_dir)?;
    let entries = top_level_entries(package_dir)?;
    if entries.is_empty() {
        return Err(UpgradeError::SafetyViolation(
            "staged package does not contain any files to promote".to_string(),
        ));
    }
    Ok(entries)
}

/// Replaces each ignored path inside `tree` with the live copy. `cache` and
/// `tmp` are recreated empty instead; live paths that do not exist are
/// skipped.
pub(crate) fn hydrate_ignored(
    filesystem: &dyn Filesystem,
    live_root: &Path,
    tree: &Path,
    ignored: &[String],
) -> Result<()> {
    for relative in ignored {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            continue;
        }
        let live = live_root.join(relative);
        let staged = tree.join(relative);

        filesystem.remove_tree(&staged)?;
        if !live.is_dir() {
            continue;
        }

        let name = Path::new(relative)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(relative);
        if EMPTY_ON_HYDRATE.contains(&name) {
            filesystem.create_dir_all(&staged)?;
            debug!(path = relative, "recreated empty");
        } else {
            filesystem.copy_tree(&live, &staged)?;
            debug!(path = relative, "hydrated from live tree");
        }
    }
    Ok(())
}

/// Copies live root dotfiles the package does not ship.
pub(crate) fn carry_over_root_dotfiles(
    filesystem: &dyn Filesystem,
    live_root: &Path,
    package_dir: &Path,
) -> Result<()> {
    for name in top_level_entries(live_root)? {
        if !name.starts_with('.') || DOTFILE_SKIP.contains(&name.as_str()) {
            continue;
        }
        let target = package_dir.join(&name);
        if filesystem.exists(&target) {
            continue;
        }
        filesystem.copy_tree(&live_root.join(&name), &target)?;
        debug!(entry = %name, "carried over root dotfile");
    }
    Ok(())
}

/// Copies non-ignored top-level live directories that are absent from the
/// package, so custom folders survive the swap.
pub(crate) fn carry_over_root_dirs(
    filesystem: &dyn Filesystem,
    live_root: &Path,
    package_dir: &Path,
    ignored: &[String],
) -> Result<()> {
    for name in top_level_entries(live_root)? {
        if name.starts_with('.') || name == "user" || ignored.iter().any(|path| *path == name) {
            continue;
        }
        let source = live_root.join(&name);
        let is_plain_dir = fs::symlink_metadata(&source)
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        if !is_plain_dir {
            continue;
        }
        let target = package_dir.join(&name);
        if filesystem.exists(&target) {
            continue;
        }
        filesystem.copy_tree(&source, &target)?;
        debug!(entry = %name, "carried over root directory");
    }
    Ok(())
}

/// `{version, name}` of every installed plugin, read from its
/// `blueprints.yaml`. Unparsable blueprints keep the defaults.
pub(crate) fn capture_plugin_snapshot(plugins_dir: &Path) -> Result<BTreeMap<String, PluginSnapshot>> {
    let mut plugins = BTreeMap::new();
    if !plugins_dir.is_dir() {
        return Ok(plugins);
    }

    for slug in top_level_entries(plugins_dir)? {
        let path = plugins_dir.join(&slug);
        if !path.is_dir() {
            continue;
        }
        let mut snapshot = PluginSnapshot {
            version: None,
            name: slug.clone(),
        };
        if let Some(blueprint) = read_yaml_mapping(&path.join("blueprints.yaml")) {
            if let Some(version) = blueprint.get("version").and_then(yaml_scalar) {
                snapshot.version = Some(version);
            }
            if let Some(name) = blueprint.get("name").and_then(yaml_scalar) {
                snapshot.name = name;
            }
        }
        plugins.insert(slug, snapshot);
    }
    Ok(plugins)
}

/// Parses `path` as a YAML mapping; missing or malformed files yield `None`.
pub(crate) fn read_yaml_mapping(path: &Path) -> Option<serde_yaml::Value> {
    let raw = fs::read_to_string(path).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).ok()?;
    value.is_mapping().then_some(value)
}

pub(crate) fn read_version_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let version = raw.trim();
            Ok((!version.is_empty()).then(|| version.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read version file {}", path.display()))
        }
    }
}
