use std::path::PathBuf;

use thiserror::Error;

/// Failure classes of the upgrade orchestrator. Callers branch on these to
/// tell bad input and missing snapshots apart from swap failures that need
/// an operator.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("rollback snapshot '{id}' is no longer available at {}", path.display())]
    SnapshotUnavailable { id: String, path: PathBuf },

    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("failed to promote staged release{}", if *restored { "" } else { "; previous live tree was NOT restored" })]
    PromoteFailed {
        restored: bool,
        #[source]
        source: anyhow::Error,
    },

    #[error("rollback failed; previous live tree left at {}", aside.display())]
    RollbackFailed {
        aside: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("another upgrade operation is running ({holder})")]
    OperationLocked { holder: String },

    #[error("an interrupted swap must be recovered first (marker: {})", marker.display())]
    SwapInProgress { marker: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpgradeError {
    /// True when the live tree may be in a state that needs manual attention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PromoteFailed { .. } | Self::RollbackFailed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::SnapshotUnavailable { .. })
    }
}
