mod config;
mod deps;
mod error;
mod fs_utils;
mod layout;
mod lock;
mod manifest_store;
mod preflight;
mod progress;
mod registry;
mod service;
mod staging;
mod swap;

pub use config::{load_config, parse_config, SafeupConfig, UpgradeOptions, DEFAULT_IGNORED_DIRS};
pub use deps::{Clock, Dependencies, Filesystem, StdFilesystem, SystemClock};
pub use error::UpgradeError;
pub use fs_utils::{copy_dir_recursive, remove_path_if_exists};
pub use layout::UpgradeLayout;
pub use lock::OperationLock;
pub use manifest_store::ManifestStore;
pub use preflight::is_constraint_compatible;
pub use progress::{ProgressEvent, ProgressSink, ProgressStage};
pub use registry::{
    NoRegistry, PackageInfo, PackageRegistry, RemoteRegistry, StaticRegistry, UpdatableQuery,
};
pub use service::SafeUpgradeService;
pub use swap::{SwapMarker, SwapOperation, SwapRecovery};

#[cfg(test)]
mod tests;
