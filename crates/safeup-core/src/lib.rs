mod manifest;
mod nested;
mod report;
mod stage_id;
mod version;

pub use manifest::{ManifestOperation, PluginSnapshot, UpgradeManifest};
pub use nested::{def_nested, get_nested, has_nested, set_nested, unset_nested, DEFAULT_SEPARATOR};
pub use report::{
    DependencyConflict, DeprecatedApiUsage, PackageKind, PendingUpdate, PreflightReport,
};
pub use stage_id::StageIdGenerator;
pub use version::{is_major_minor_change, major_minor};

#[cfg(test)]
mod tests;
