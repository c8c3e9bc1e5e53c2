use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use safeup_core::{DependencyConflict, DeprecatedApiUsage, PackageKind, PendingUpdate};
use serde_json::Value;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::fs_utils::top_level_entries;
use crate::staging::read_yaml_mapping;
use crate::{PackageRegistry, UpdatableQuery, UpgradeLayout, UpgradeOptions};

pub(crate) const PENDING_MAJOR_WARNING: &str =
    "Because this is a major upgrade, update pending plugins and themes before continuing.";
pub(crate) const PENDING_WARNING: &str =
    "Pending plugin/theme updates detected. Update them before running the upgrade.";

const SKIPPED_SOURCE_DIRS: [&str; 2] = ["vendor", "node_modules"];

pub(crate) fn conflicts_warning(library: &str) -> String {
    format!("Potential {library} signature conflicts detected.")
}

pub(crate) fn deprecated_api_warning(library: &str) -> String {
    format!("Potential {library} logger API incompatibilities detected.")
}

/// Flattens the registry's updatable packages into `slug -> update`,
/// skipping unpublished packages, disabled plugins and inactive themes.
pub(crate) fn detect_pending_updates(
    registry: &dyn PackageRegistry,
    layout: &UpgradeLayout,
) -> Result<BTreeMap<String, PendingUpdate>> {
    let updatable = registry
        .updatable(UpdatableQuery::all())
        .context("Unable to query package registry")?;

    let mut pending = BTreeMap::new();
    for (kind, packages) in updatable {
        for (slug, package) in packages {
            if !package.is_published() {
                debug!(slug = %slug, "skipping unpublished package");
                continue;
            }
            let enabled = match kind {
                PackageKind::Plugins => is_plugin_enabled(layout, &slug),
                PackageKind::Themes => is_theme_enabled(layout, &slug),
            };
            if !enabled {
                continue;
            }
            pending.insert(
                slug,
                PendingUpdate {
                    kind,
                    current: package.version,
                    available: package.available,
                },
            );
        }
    }
    Ok(pending)
}

/// Scans each enabled plugin's declaration file for a constraint on the
/// shared library and reports the ones the target release cannot satisfy.
pub(crate) fn detect_dependency_conflicts(
    layout: &UpgradeLayout,
    options: &UpgradeOptions,
) -> Result<BTreeMap<String, DependencyConflict>> {
    let plugins_dir = layout.plugins_dir();
    let mut conflicts = BTreeMap::new();
    if !plugins_dir.is_dir() {
        return Ok(conflicts);
    }

    for slug in top_level_entries(&plugins_dir)? {
        let plugin_dir = plugins_dir.join(&slug);
        if !plugin_dir.is_dir() {
            continue;
        }
        let declaration = plugin_dir.join(&options.declaration_file);
        let Some(raw_constraint) = declared_constraint(&declaration, &options.shared_library)
        else {
            continue;
        };
        if !is_plugin_enabled(layout, &slug) {
            continue;
        }
        if is_constraint_compatible(&raw_constraint) {
            continue;
        }
        conflicts.insert(
            slug,
            DependencyConflict {
                declaration,
                requires: raw_constraint,
            },
        );
    }
    Ok(conflicts)
}

/// Walks each enabled plugin's sources and records the first call matching
/// the deprecated API pattern in every file. Hidden entries and bundled
/// dependency folders are skipped.
pub(crate) fn detect_deprecated_api_usage(
    layout: &UpgradeLayout,
    options: &UpgradeOptions,
) -> Result<BTreeMap<String, Vec<DeprecatedApiUsage>>> {
    let mut usages = BTreeMap::new();
    let plugins_dir = layout.plugins_dir();
    if options.deprecated_api_pattern.is_empty() || !plugins_dir.is_dir() {
        return Ok(usages);
    }
    let pattern = Regex::new(&options.deprecated_api_pattern).with_context(|| {
        format!("invalid deprecated API pattern {}", options.deprecated_api_pattern)
    })?;

    for slug in top_level_entries(&plugins_dir)? {
        let plugin_dir = plugins_dir.join(&slug);
        if !plugin_dir.is_dir() || !is_plugin_enabled(layout, &slug) {
            continue;
        }
        let walker = WalkDir::new(&plugin_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_source_entry(entry));
        let mut found = Vec::new();
        for entry in walker.filter_map(|entry| entry.ok()) {
            if !entry.file_type().is_file() || !has_source_extension(entry.path(), options) {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                debug!(path = %entry.path().display(), "skipping unreadable plugin source");
                continue;
            };
            let Some(matched) = pattern.find(&content) else {
                continue;
            };
            let file = entry
                .path()
                .strip_prefix(layout.root())
                .unwrap_or(entry.path())
                .to_path_buf();
            found.push(DeprecatedApiUsage {
                file,
                method: matched.as_str().trim().to_string(),
            });
        }
        if !found.is_empty() {
            usages.insert(slug, found);
        }
    }
    Ok(usages)
}

fn is_skipped_source_entry(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.')
        || (entry.file_type().is_dir() && SKIPPED_SOURCE_DIRS.iter().any(|dir| name == *dir))
}

fn has_source_extension(path: &Path, options: &UpgradeOptions) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            options
                .source_extensions
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(extension))
        })
}

/// `require[library]`, falling back to `require-dev[library]`.
fn declared_constraint(path: &Path, library: &str) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let json: Value = serde_json::from_str(&raw).ok()?;
    if !json.is_object() {
        return None;
    }
    ["require", "require-dev"]
        .iter()
        .find_map(|section| json.get(section)?.get(library)?.as_str().map(str::to_string))
        .filter(|constraint| !constraint.trim().is_empty())
}

/// Coarse compatibility rule for a declared constraint: the wildcard, any
/// constraint mentioning major 3 or 4, or a `>=` lower bound of 3 or more.
/// Constraints such as `^13.0` are knowingly misclassified. Only case is
/// folded, so `" * "` does not count as the wildcard.
pub fn is_constraint_compatible(raw: &str) -> bool {
    let constraint = raw.to_lowercase();
    constraint == "*"
        || constraint.contains('3')
        || constraint.contains('4')
        || minimum_bound(&constraint).is_some_and(|minimum| minimum >= 3)
}

fn minimum_bound(constraint: &str) -> Option<u64> {
    let (_, rest) = constraint.split_once(">=")?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Plugins are enabled unless their config says `enabled: false`.
/// Unreadable config counts as enabled.
pub(crate) fn is_plugin_enabled(layout: &UpgradeLayout, slug: &str) -> bool {
    read_yaml_mapping(&layout.plugin_config_path(slug))
        .and_then(|config| config.get("enabled").and_then(serde_yaml::Value::as_bool))
        .unwrap_or(true)
}

/// Only the active theme counts; without a readable system config every
/// theme is treated as active.
pub(crate) fn is_theme_enabled(layout: &UpgradeLayout, slug: &str) -> bool {
    let Some(config) = read_yaml_mapping(&layout.system_config_path()) else {
        return true;
    };
    let active = config
        .get("pages")
        .and_then(|pages| pages.get("theme"))
        .or_else(|| {
            config
                .get("system")
                .and_then(|system| system.get("pages"))
                .and_then(|pages| pages.get("theme"))
        })
        .and_then(serde_yaml::Value::as_str);
    match active {
        Some(active) => active == slug,
        None => true,
    }
}
