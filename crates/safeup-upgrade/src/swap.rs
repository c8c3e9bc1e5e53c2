//! Rename-based swap of the live tree.
//!
//! A marker file is written before the first rename and removed after the
//! second, so an interrupted swap can be finished or reversed on the next
//! run instead of leaving the installation without a live tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{Filesystem, UpgradeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapOperation {
    Promote,
    Rollback,
}

/// Contents of `swap.json`. `package` is set for promotions, `aside` for
/// rollbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapMarker {
    pub operation: SwapOperation,
    pub manifest_id: String,
    pub live: PathBuf,
    pub backup: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aside: Option<PathBuf>,
    pub started_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapRecovery {
    /// No interrupted swap was found.
    Clean,
    /// The second rename had happened; leftover bookkeeping was finished.
    Completed(SwapMarker),
    /// The live tree was put back to its state before the operation.
    Reversed(SwapMarker),
}

pub(crate) fn read_marker(path: &Path) -> Result<Option<SwapMarker>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read swap marker: {}", path.display()));
        }
    };
    let marker = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing swap marker: {}", path.display()))?;
    Ok(Some(marker))
}

fn write_marker(path: &Path, marker: &SwapMarker) -> Result<()> {
    let raw = serde_json::to_string_pretty(marker).context("failed to serialize swap marker")?;
    fs::write(path, raw)
        .with_context(|| format!("failed to write swap marker: {}", path.display()))
}

fn clear_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to clear swap marker: {}", path.display()))
        }
    }
}

/// `live -> backup`, then `package -> live`. If the second rename fails the
/// backup is renamed back; the marker is kept when that restore fails too.
pub(crate) fn promote_swap(
    filesystem: &dyn Filesystem,
    marker_path: &Path,
    marker: &SwapMarker,
) -> Result<(), UpgradeError> {
    let package = marker
        .package
        .as_deref()
        .ok_or_else(|| anyhow!("promotion marker has no package path"))?;
    write_marker(marker_path, marker)?;

    if let Err(source) = filesystem.rename(&marker.live, &marker.backup) {
        clear_marker(marker_path)?;
        return Err(UpgradeError::PromoteFailed {
            restored: true,
            source,
        });
    }

    if let Err(source) = filesystem.rename(package, &marker.live) {
        error!(error = %format!("{source:#}"), "promotion rename failed, restoring live tree");
        return match filesystem.rename(&marker.backup, &marker.live) {
            Ok(()) => {
                clear_marker(marker_path)?;
                Err(UpgradeError::PromoteFailed {
                    restored: true,
                    source,
                })
            }
            Err(restore_err) => {
                error!(
                    error = %format!("{restore_err:#}"),
                    marker = %marker_path.display(),
                    "failed restoring live tree; swap marker kept for recovery"
                );
                Err(UpgradeError::PromoteFailed {
                    restored: false,
                    source,
                })
            }
        };
    }

    clear_marker(marker_path)?;
    info!(live = %marker.live.display(), backup = %marker.backup.display(), "promotion swap complete");
    Ok(())
}

/// `live -> aside`, then `backup -> live`. When the second rename fails the
/// aside tree and the marker are left in place for recovery.
pub(crate) fn rollback_swap(
    filesystem: &dyn Filesystem,
    marker_path: &Path,
    marker: &SwapMarker,
) -> Result<(), UpgradeError> {
    let aside = marker
        .aside
        .as_deref()
        .ok_or_else(|| anyhow!("rollback marker has no aside path"))?;
    write_marker(marker_path, marker)?;

    if let Err(source) = filesystem.rename(&marker.live, aside) {
        clear_marker(marker_path)?;
        return Err(UpgradeError::RollbackFailed {
            aside: marker.live.clone(),
            source,
        });
    }

    if let Err(source) = filesystem.rename(&marker.backup, &marker.live) {
        error!(
            error = %format!("{source:#}"),
            aside = %aside.display(),
            "rollback rename failed; previous live tree left aside"
        );
        return Err(UpgradeError::RollbackFailed {
            aside: aside.to_path_buf(),
            source,
        });
    }

    if let Err(err) = filesystem.remove_tree(aside) {
        warn!(aside = %aside.display(), error = %format!("{err:#}"), "failed removing rotated-aside tree");
    }
    clear_marker(marker_path)?;
    info!(live = %marker.live.display(), backup = %marker.backup.display(), "rollback swap complete");
    Ok(())
}

/// Inspects an existing marker and either finishes or reverses the swap it
/// describes. Reversal is the default whenever the live tree is missing.
pub(crate) fn recover(
    filesystem: &dyn Filesystem,
    marker_path: &Path,
) -> Result<SwapRecovery, UpgradeError> {
    let Some(marker) = read_marker(marker_path)? else {
        return Ok(SwapRecovery::Clean);
    };

    let live_present = filesystem.exists(&marker.live);
    let backup_present = filesystem.exists(&marker.backup);

    let outcome = match marker.operation {
        SwapOperation::Promote => {
            let package_present = marker
                .package
                .as_deref()
                .map(|package| filesystem.exists(package))
                .unwrap_or(false);
            if !live_present {
                if !backup_present {
                    return Err(anyhow!(
                        "cannot recover promotion {}: neither {} nor {} exists",
                        marker.manifest_id,
                        marker.live.display(),
                        marker.backup.display()
                    )
                    .into());
                }
                filesystem.rename(&marker.backup, &marker.live)?;
                SwapRecovery::Reversed(marker)
            } else if backup_present && !package_present {
                SwapRecovery::Completed(marker)
            } else {
                SwapRecovery::Reversed(marker)
            }
        }
        SwapOperation::Rollback => {
            let aside = marker.aside.clone();
            let aside_present = aside
                .as_deref()
                .map(|aside| filesystem.exists(aside))
                .unwrap_or(false);
            if !live_present {
                let Some(aside) = aside.filter(|_| aside_present) else {
                    return Err(anyhow!(
                        "cannot recover rollback {}: live tree {} is missing and no aside tree exists",
                        marker.manifest_id,
                        marker.live.display()
                    )
                    .into());
                };
                filesystem.rename(&aside, &marker.live)?;
                SwapRecovery::Reversed(marker)
            } else if !backup_present {
                if let Some(aside) = aside.filter(|_| aside_present) {
                    filesystem.remove_tree(&aside)?;
                }
                SwapRecovery::Completed(marker)
            } else {
                SwapRecovery::Reversed(marker)
            }
        }
    };

    clear_marker(marker_path)?;
    match &outcome {
        SwapRecovery::Completed(marker) => {
            info!(id = %marker.manifest_id, "interrupted swap completed")
        }
        SwapRecovery::Reversed(marker) => {
            info!(id = %marker.manifest_id, "interrupted swap reversed")
        }
        SwapRecovery::Clean => {}
    }
    Ok(outcome)
}
