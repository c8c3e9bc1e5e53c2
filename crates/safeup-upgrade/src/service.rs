use std::fs;
use std::path::Path;

use safeup_core::{
    is_major_minor_change, ManifestOperation, PreflightReport, StageIdGenerator, UpgradeManifest,
};
use tracing::{debug, info, warn};

use crate::lock::OperationLock;
use crate::manifest_store::{read_stage_manifest, write_stage_manifest};
use crate::preflight::{
    conflicts_warning, deprecated_api_warning, detect_dependency_conflicts,
    detect_deprecated_api_usage, detect_pending_updates, PENDING_MAJOR_WARNING, PENDING_WARNING,
};
use crate::staging::{
    capture_plugin_snapshot, carry_over_root_dirs, carry_over_root_dotfiles, effective_ignored,
    hydrate_ignored, read_version_file, stage_package,
};
use crate::swap::{self, SwapMarker, SwapOperation, SwapRecovery};
use crate::{
    Dependencies, ManifestStore, ProgressEvent, ProgressSink, ProgressStage, UpgradeError,
    UpgradeLayout, UpgradeOptions,
};

/// Orchestrates preflight checks, promotion, rollback and snapshots of one
/// live installation.
pub struct SafeUpgradeService {
    layout: UpgradeLayout,
    options: UpgradeOptions,
    deps: Dependencies,
    store: ManifestStore,
    stage_ids: StageIdGenerator,
    progress: Option<Box<dyn ProgressSink>>,
    last_manifest: Option<UpgradeManifest>,
}

impl SafeUpgradeService {
    pub fn new(layout: UpgradeLayout, options: UpgradeOptions, deps: Dependencies) -> Self {
        let store = ManifestStore::new(layout.manifest_store());
        Self {
            layout,
            options,
            deps,
            store,
            stage_ids: StageIdGenerator::new(),
            progress: None,
            last_manifest: None,
        }
    }

    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn layout(&self) -> &UpgradeLayout {
        &self.layout
    }

    pub fn manifest_store(&self) -> &ManifestStore {
        &self.store
    }

    /// Manifest produced by the last promote, rollback or snapshot on this
    /// instance.
    pub fn last_manifest(&self) -> Option<&UpgradeManifest> {
        self.last_manifest.as_ref()
    }

    /// Version of the live installation: configured value, else the
    /// `VERSION` file, else `"unknown"`.
    pub fn current_version(&self) -> Result<String, UpgradeError> {
        if let Some(version) = &self.options.current_version {
            return Ok(version.clone());
        }
        Ok(read_version_file(&self.layout.version_file_path())?
            .unwrap_or_else(|| "unknown".to_string()))
    }

    pub fn preflight(&self, target_version: Option<&str>) -> Result<PreflightReport, UpgradeError> {
        let mut report = PreflightReport::default();
        if let Some(target) = target_version {
            report.is_major_minor_upgrade = is_major_minor_change(&self.current_version()?, target);
        }

        match detect_pending_updates(self.deps.registry.as_ref(), &self.layout) {
            Ok(pending) => report.plugins_pending = pending,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "pending update check skipped");
                report.warnings.push(format!("{err:#}"));
            }
        }
        report.dependency_conflicts = detect_dependency_conflicts(&self.layout, &self.options)?;
        report.deprecated_api_usages = detect_deprecated_api_usage(&self.layout, &self.options)?;

        if !report.plugins_pending.is_empty() {
            report.warnings.push(if report.is_major_minor_upgrade {
                PENDING_MAJOR_WARNING.to_string()
            } else {
                PENDING_WARNING.to_string()
            });
        }
        if !report.dependency_conflicts.is_empty() {
            report
                .warnings
                .push(conflicts_warning(&self.options.shared_library));
        }
        if !report.deprecated_api_usages.is_empty() {
            report
                .warnings
                .push(deprecated_api_warning(&self.options.deprecated_api_library));
        }

        debug!(
            pending = report.plugins_pending.len(),
            conflicts = report.dependency_conflicts.len(),
            deprecated = report.deprecated_api_usages.len(),
            warnings = report.warnings.len(),
            "preflight finished"
        );
        Ok(report)
    }

    /// Stages `extracted`, hydrates it from the live tree and swaps it in.
    /// Nothing in the live tree changes before the final rename.
    pub fn promote(
        &mut self,
        extracted: &Path,
        target_version: &str,
        ignored: &[String],
    ) -> Result<UpgradeManifest, UpgradeError> {
        if !extracted.is_dir() {
            return Err(UpgradeError::InvalidArgument(format!(
                "extracted package path \"{}\" is not a directory",
                extracted.display()
            )));
        }
        if target_version.trim().is_empty() {
            return Err(UpgradeError::InvalidArgument(
                "target version must not be empty".to_string(),
            ));
        }
        let ignored = effective_ignored(ignored, &self.options.ignored_dirs)?;
        self.ensure_no_pending_swap()?;

        let filesystem = self.deps.filesystem.as_ref();
        filesystem.create_dir_all(self.layout.staging_root())?;
        let id = self
            .stage_ids
            .next_id("stage", self.deps.clock.now())?;
        let _lock = OperationLock::acquire(&self.layout.lock_path(), "promote", &id)?;

        let stage_dir = self.layout.stage_dir(&id);
        let package_dir = self.layout.package_dir(&id);
        let backup_dir = self.layout.backup_dir(&id);
        info!(id = %id, target = target_version, "promoting staged release");

        let manifest = match self.prepare_stage(&id, extracted, target_version, &ignored) {
            Ok(manifest) => manifest,
            Err(err) => {
                self.discard_stage(&stage_dir);
                return Err(err);
            }
        };

        emit(
            &mut self.progress,
            ProgressStage::Swap,
            "Swapping live tree...",
            None,
        );
        let marker = SwapMarker {
            operation: SwapOperation::Promote,
            manifest_id: id.clone(),
            live: self.layout.root().to_path_buf(),
            backup: backup_dir,
            package: Some(package_dir),
            aside: None,
            started_at: self.deps.clock.now_unix(),
        };
        if let Err(err) = swap::promote_swap(
            self.deps.filesystem.as_ref(),
            &self.layout.swap_marker_path(),
            &marker,
        ) {
            if matches!(err, UpgradeError::PromoteFailed { restored: true, .. }) {
                self.discard_stage(&stage_dir);
            }
            return Err(err);
        }

        emit(
            &mut self.progress,
            ProgressStage::Finalize,
            "Finalizing upgrade...",
            None,
        );
        self.store.persist(&manifest)?;
        self.prune()?;
        self.discard_stage(&stage_dir);

        emit(
            &mut self.progress,
            ProgressStage::Complete,
            &format!("Upgrade to {target_version} complete."),
            Some(100),
        );
        self.last_manifest = Some(manifest.clone());
        Ok(manifest)
    }

    fn prepare_stage(
        &mut self,
        id: &str,
        extracted: &Path,
        target_version: &str,
        ignored: &[String],
    ) -> Result<UpgradeManifest, UpgradeError> {
        let filesystem = self.deps.filesystem.as_ref();
        let root = self.layout.root();
        let package_dir = self.layout.package_dir(id);

        emit(
            &mut self.progress,
            ProgressStage::Staging,
            "Preparing staged package...",
            None,
        );
        stage_package(filesystem, extracted, &package_dir)?;
        carry_over_root_dotfiles(filesystem, root, &package_dir)?;

        emit(
            &mut self.progress,
            ProgressStage::Hydrating,
            "Hydrating preserved directories...",
            None,
        );
        hydrate_ignored(filesystem, root, &package_dir, ignored)?;
        carry_over_root_dirs(filesystem, root, &package_dir, ignored)?;

        let manifest = self.build_manifest(
            id,
            ManifestOperation::Upgrade,
            target_version,
            Some(package_dir),
            ignored,
        )?;
        write_stage_manifest(&self.layout.stage_manifest_path(id), &manifest)?;
        Ok(manifest)
    }

    /// Restores the backup recorded by a manifest (latest when `id` is
    /// `None`). Returns `Ok(None)` when no such manifest exists.
    pub fn rollback(&mut self, id: Option<&str>) -> Result<Option<UpgradeManifest>, UpgradeError> {
        if let Some(id) = id {
            validate_manifest_id(id)?;
        }
        self.ensure_no_pending_swap()?;

        let Some(mut manifest) = self.store.resolve(id)? else {
            return Ok(None);
        };
        let filesystem = self.deps.filesystem.as_ref();
        if !filesystem.exists(&manifest.backup_path) {
            return Err(UpgradeError::SnapshotUnavailable {
                id: manifest.id,
                path: manifest.backup_path,
            });
        }

        filesystem.create_dir_all(self.layout.staging_root())?;
        let _lock = OperationLock::acquire(&self.layout.lock_path(), "rollback", &manifest.id)?;
        info!(id = %manifest.id, backup = %manifest.backup_path.display(), "rolling back");

        let ignored = effective_ignored(&manifest.ignored, &self.options.ignored_dirs)?;
        emit(
            &mut self.progress,
            ProgressStage::Rollback,
            "Hydrating snapshot from live tree...",
            None,
        );
        hydrate_ignored(
            self.deps.filesystem.as_ref(),
            self.layout.root(),
            &manifest.backup_path,
            &ignored,
        )?;

        emit(
            &mut self.progress,
            ProgressStage::Rollback,
            "Restoring snapshot...",
            None,
        );
        let now = self.deps.clock.now_unix();
        let marker = SwapMarker {
            operation: SwapOperation::Rollback,
            manifest_id: manifest.id.clone(),
            live: self.layout.root().to_path_buf(),
            backup: manifest.backup_path.clone(),
            package: None,
            aside: Some(self.layout.aside_dir(&manifest.id, now)),
            started_at: now,
        };
        swap::rollback_swap(
            self.deps.filesystem.as_ref(),
            &self.layout.swap_marker_path(),
            &marker,
        )?;

        if !self.store.mark_rolled_back(&manifest.id, now)? {
            warn!(id = %manifest.id, "manifest missing from restored tree; recording it again");
            manifest.rolled_back_at = Some(now);
            self.store.persist(&manifest)?;
        }
        manifest.rolled_back_at = Some(now);

        emit(
            &mut self.progress,
            ProgressStage::Complete,
            &format!("Snapshot {} restored.", manifest.id),
            Some(100),
        );
        self.last_manifest = Some(manifest.clone());
        Ok(Some(manifest))
    }

    /// Copies the live tree into a new backup and records it as a manual
    /// snapshot.
    pub fn create_snapshot(&mut self, label: Option<&str>) -> Result<UpgradeManifest, UpgradeError> {
        self.ensure_no_pending_swap()?;
        let filesystem = self.deps.filesystem.as_ref();
        let root = self.layout.root();
        if !filesystem.has_entries(root) {
            return Err(UpgradeError::SafetyViolation(format!(
                "unable to locate files to snapshot in {}",
                root.display()
            )));
        }

        filesystem.create_dir_all(self.layout.staging_root())?;
        let id = self
            .stage_ids
            .next_id("stage", self.deps.clock.now())?;
        let _lock = OperationLock::acquire(&self.layout.lock_path(), "snapshot", &id)?;
        let backup_dir = self.layout.backup_dir(&id);

        emit(
            &mut self.progress,
            ProgressStage::Snapshot,
            "Creating manual snapshot...",
            None,
        );
        if let Err(err) = self.deps.filesystem.copy_tree(self.layout.root(), &backup_dir) {
            self.discard_stage(&backup_dir);
            return Err(err.into());
        }

        let source_version = self.current_version()?;
        let ignored = self.options.ignored_dirs.clone();
        let mut manifest = self.build_manifest(
            &id,
            ManifestOperation::Snapshot,
            &source_version,
            None,
            &ignored,
        )?;
        manifest.label = label
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string);

        self.store.persist(&manifest)?;
        self.prune()?;
        emit(
            &mut self.progress,
            ProgressStage::Complete,
            &format!("Snapshot {id} created."),
            Some(100),
        );
        info!(id = %id, "manual snapshot created");
        self.last_manifest = Some(manifest.clone());
        Ok(manifest)
    }

    /// Newest first.
    pub fn list_manifests(&self) -> Result<Vec<UpgradeManifest>, UpgradeError> {
        Ok(self.store.list()?)
    }

    /// Best-effort removal of the operator-attention flag.
    pub fn clear_recovery_flag(&self) {
        let flag = self.layout.recovery_flag_path();
        if flag.is_file() {
            if let Err(err) = fs::remove_file(&flag) {
                debug!(flag = %flag.display(), error = %err, "ignoring recovery flag removal failure");
            }
        }
    }

    /// Finishes or reverses a swap interrupted by a crash and tidies the
    /// manifest store and staging area accordingly.
    pub fn recover_interrupted_swap(&mut self) -> Result<SwapRecovery, UpgradeError> {
        let marker_path = self.layout.swap_marker_path();
        if !marker_path.is_file() {
            return Ok(SwapRecovery::Clean);
        }
        let _lock = OperationLock::acquire(&self.layout.lock_path(), "recover", "swap")?;
        let outcome = swap::recover(self.deps.filesystem.as_ref(), &marker_path)?;

        match &outcome {
            SwapRecovery::Completed(marker) if marker.operation == SwapOperation::Promote => {
                let stage_manifest = self.layout.stage_manifest_path(&marker.manifest_id);
                match read_stage_manifest(&stage_manifest)? {
                    Some(manifest) => {
                        self.store.persist(&manifest)?;
                        self.last_manifest = Some(manifest);
                    }
                    None => warn!(id = %marker.manifest_id, "stage manifest missing; promotion left unrecorded"),
                }
                self.discard_stage(&self.layout.stage_dir(&marker.manifest_id));
            }
            SwapRecovery::Completed(marker) => {
                self.store
                    .mark_rolled_back(&marker.manifest_id, self.deps.clock.now_unix())?;
            }
            SwapRecovery::Reversed(marker) if marker.operation == SwapOperation::Promote => {
                self.discard_stage(&self.layout.stage_dir(&marker.manifest_id));
            }
            SwapRecovery::Reversed(_) | SwapRecovery::Clean => {}
        }
        Ok(outcome)
    }

    /// Removes a lock file left behind by a crashed process. Returns the
    /// recorded holder, if any.
    pub fn release_stale_lock(&self) -> Result<Option<String>, UpgradeError> {
        let path = self.layout.lock_path();
        let holder = crate::lock::read_lock_holder(&path);
        if self.deps.filesystem.exists(&path) {
            self.deps.filesystem.remove_tree(&path)?;
            warn!(lock = %path.display(), holder = ?holder, "released stale operation lock");
        }
        Ok(holder)
    }

    fn build_manifest(
        &self,
        id: &str,
        operation: ManifestOperation,
        target_version: &str,
        package_path: Option<std::path::PathBuf>,
        ignored: &[String],
    ) -> Result<UpgradeManifest, UpgradeError> {
        Ok(UpgradeManifest {
            id: id.to_string(),
            created_at: self.deps.clock.now_unix(),
            source_version: self.current_version()?,
            target_version: target_version.to_string(),
            runtime_version: self.options.runtime_version.clone(),
            package_path,
            backup_path: self.layout.backup_dir(id),
            ignored: ignored.to_vec(),
            plugins: capture_plugin_snapshot(&self.layout.plugins_dir())?,
            operation,
            label: None,
            rolled_back_at: None,
        })
    }

    fn prune(&self) -> Result<(), UpgradeError> {
        let pruned = self.store.prune(
            self.options.snapshot_limit,
            self.layout.staging_root(),
            self.deps.filesystem.as_ref(),
        )?;
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned old snapshots");
        }
        Ok(())
    }

    fn ensure_no_pending_swap(&self) -> Result<(), UpgradeError> {
        let marker = self.layout.swap_marker_path();
        if self.deps.filesystem.exists(&marker) {
            return Err(UpgradeError::SwapInProgress { marker });
        }
        Ok(())
    }

    fn discard_stage(&self, path: &Path) {
        if let Err(err) = self.deps.filesystem.remove_tree(path) {
            warn!(path = %path.display(), error = %format!("{err:#}"), "failed to clean up staging directory");
        }
    }
}

fn validate_manifest_id(id: &str) -> Result<(), UpgradeError> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(UpgradeError::InvalidArgument(format!(
            "invalid manifest id: {id}"
        )));
    }
    Ok(())
}

fn emit(
    progress: &mut Option<Box<dyn ProgressSink>>,
    stage: ProgressStage,
    message: &str,
    percent: Option<u8>,
) {
    debug!(stage = %stage, "{message}");
    if let Some(sink) = progress.as_mut() {
        sink.report(&ProgressEvent {
            stage,
            message: message.to_string(),
            percent,
        });
    }
}
