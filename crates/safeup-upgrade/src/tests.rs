use super::*;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use safeup_core::{ManifestOperation, PackageKind, UpgradeManifest};
use safeup_security::tree_digest_hex;

use crate::manifest_store::write_stage_manifest;

#[test]
fn promote_replaces_release_files_and_preserves_user_data() {
    let fixture = Fixture::new();
    let user_before = read_tree(&fixture.live().join("user"), &[]);
    let original = read_tree(&fixture.live(), &[]);

    let mut service = fixture.service();
    let manifest = service
        .promote(&fixture.package, "1.8.0", &strings(&["user", "cache"]))
        .expect("must promote");

    let live = fixture.live();
    assert_eq!(read_tree(&live.join("user"), &["data"]), user_before);
    assert!(live.join("cache").is_dir());
    assert!(fs::read_dir(live.join("cache"))
        .expect("must read cache")
        .next()
        .is_none());
    assert_eq!(
        fs::read_to_string(live.join("index.php")).expect("must read index"),
        "<?php // 1.8\n"
    );
    assert_eq!(
        fs::read_to_string(live.join(".htaccess")).expect("dotfile carried over"),
        "RewriteEngine On\n"
    );
    assert!(live.join("media").join("photo.txt").is_file());

    assert_eq!(manifest.target_version, "1.8.0");
    assert_eq!(manifest.source_version, "1.7.48");
    assert_eq!(manifest.operation, ManifestOperation::Upgrade);
    assert_eq!(manifest.ignored, strings(&["user", "cache"]));
    assert_eq!(
        manifest.plugins.get("alpha").and_then(|plugin| plugin.version.as_deref()),
        Some("2.1.0")
    );
    assert_eq!(read_tree(&manifest.backup_path, &[]), original);
    assert!(!fixture.layout.stage_dir(&manifest.id).exists());
    assert!(!fixture.layout.swap_marker_path().exists());
    assert!(!fixture.layout.lock_path().exists());

    let resolved = service
        .manifest_store()
        .resolve(Some(&manifest.id))
        .expect("must resolve")
        .expect("manifest must exist");
    assert_eq!(resolved.id, manifest.id);
    assert_eq!(resolved.source_version, "1.7.48");
    assert_eq!(resolved.target_version, "1.8.0");
    assert!(resolved.backup_path.is_dir());
    assert!(resolved.rolled_back_at.is_none());
    assert_eq!(service.last_manifest().map(|m| m.id.as_str()), Some(manifest.id.as_str()));

    fixture.cleanup();
}

#[test]
fn rollback_restores_pre_upgrade_tree_except_hydrated_paths() {
    let fixture = Fixture::new();
    let ignored = strings(&["user", "cache"]);
    let before = read_tree(&fixture.live(), &["user", "cache"]);

    let mut service = fixture.service();
    let promoted = service
        .promote(&fixture.package, "1.8.0", &ignored)
        .expect("must promote");
    write_file(
        &fixture.live().join("user").join("accounts").join("editor.yaml"),
        "email: editor@example.test\n",
    );

    let rolled_back = service
        .rollback(None)
        .expect("must roll back")
        .expect("a manifest must exist");
    assert_eq!(rolled_back.id, promoted.id);
    assert!(rolled_back.rolled_back_at.is_some());

    let live = fixture.live();
    assert_eq!(read_tree(&live, &["user", "cache"]), before);
    assert!(live.join("user").join("accounts").join("editor.yaml").is_file());
    assert!(!promoted.backup_path.exists());

    let stored = service
        .manifest_store()
        .load(&promoted.id)
        .expect("must load")
        .expect("manifest must survive rollback");
    assert!(stored.is_rolled_back());

    let leftovers: Vec<String> = fs::read_dir(fixture.layout.staging_root())
        .expect("must read staging root")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("rollback-"))
        .collect();
    assert!(leftovers.is_empty(), "aside tree must be removed: {leftovers:?}");

    fixture.cleanup();
}

#[test]
fn pruning_keeps_newest_three_snapshots() {
    let fixture = Fixture::new();
    let mut service = fixture.service();

    let mut manifests = Vec::new();
    for target in ["1.8.0", "1.8.1", "1.8.2", "1.8.3", "1.8.4"] {
        manifests.push(
            service
                .promote(&fixture.package, target, &[])
                .expect("must promote"),
        );
    }

    let ids = service.manifest_store().ids().expect("must list ids");
    let expected: Vec<String> = manifests[2..].iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, expected);
    for pruned in &manifests[..2] {
        assert!(!pruned.backup_path.exists());
    }
    for kept in &manifests[2..] {
        assert!(kept.backup_path.is_dir());
    }

    let listed = service.list_manifests().expect("must list");
    assert_eq!(listed.first().map(|m| m.target_version.as_str()), Some("1.8.4"));

    fixture.cleanup();
}

#[test]
fn snapshot_limit_zero_disables_pruning() {
    let fixture = Fixture::new();
    let options = UpgradeOptions {
        snapshot_limit: 0,
        ..UpgradeOptions::default()
    };
    let mut service = SafeUpgradeService::new(fixture.layout.clone(), options, Dependencies::default());
    for _ in 0..4 {
        service.create_snapshot(None).expect("must snapshot");
    }
    assert_eq!(service.manifest_store().ids().expect("must list").len(), 4);

    fixture.cleanup();
}

#[test]
fn promote_rejects_non_directory_and_unsafe_ignore_lists() {
    let fixture = Fixture::new();
    let mut service = fixture.service();

    let err = service
        .promote(&fixture.base.join("missing"), "1.8.0", &[])
        .expect_err("missing package must fail");
    assert!(matches!(err, UpgradeError::InvalidArgument(_)));
    assert!(!err.is_fatal());

    let err = service
        .promote(&fixture.package, "1.8.0", &strings(&["cache"]))
        .expect_err("ignore list without user must fail");
    assert!(matches!(err, UpgradeError::SafetyViolation(_)));

    let empty = fixture.base.join("empty-package");
    fs::create_dir_all(&empty).expect("must create empty package");
    let err = service
        .promote(&empty, "1.8.0", &[])
        .expect_err("empty package must fail");
    assert!(matches!(err, UpgradeError::SafetyViolation(_)));
    assert_eq!(
        fs::read_to_string(fixture.live().join("index.php")).expect("live untouched"),
        "<?php // 1.7\n"
    );
    assert!(service.manifest_store().ids().expect("must list").is_empty());

    fixture.cleanup();
}

#[test]
fn failed_promotion_rename_restores_live_tree() {
    let fixture = Fixture::new();
    let before = read_tree(&fixture.live(), &[]);
    let deps = Dependencies::default().with_filesystem(Box::new(FaultyFilesystem {
        fail_package: true,
        fail_restore: false,
        empty_root: false,
    }));
    let mut service = SafeUpgradeService::new(fixture.layout.clone(), UpgradeOptions::default(), deps);

    let err = service
        .promote(&fixture.package, "1.8.0", &[])
        .expect_err("injected failure must surface");
    assert!(matches!(err, UpgradeError::PromoteFailed { restored: true, .. }));
    assert!(err.is_fatal());
    assert_eq!(read_tree(&fixture.live(), &[]), before);
    assert!(!fixture.layout.swap_marker_path().exists());
    assert!(service.manifest_store().ids().expect("must list").is_empty());

    fixture.cleanup();
}

#[test]
fn snapshot_refuses_root_the_filesystem_reports_empty() {
    let fixture = Fixture::new();
    let deps = Dependencies::default().with_filesystem(Box::new(FaultyFilesystem {
        fail_package: false,
        fail_restore: false,
        empty_root: true,
    }));
    let mut service = SafeUpgradeService::new(fixture.layout.clone(), UpgradeOptions::default(), deps);

    let err = service
        .create_snapshot(Some("manual"))
        .expect_err("empty root must be refused");
    assert!(matches!(err, UpgradeError::SafetyViolation(_)));
    assert!(service.manifest_store().ids().expect("must list").is_empty());

    fixture.cleanup();
}

#[test]
fn interrupted_promotion_is_reversed_by_recovery() {
    let fixture = Fixture::new();
    let before = read_tree(&fixture.live(), &[]);
    let deps = Dependencies::default().with_filesystem(Box::new(FaultyFilesystem {
        fail_package: true,
        fail_restore: true,
        empty_root: false,
    }));
    let mut failing = SafeUpgradeService::new(fixture.layout.clone(), UpgradeOptions::default(), deps);
    let err = failing
        .promote(&fixture.package, "1.8.0", &[])
        .expect_err("promotion must fail");
    assert!(matches!(err, UpgradeError::PromoteFailed { restored: false, .. }));
    assert!(!fixture.live().exists());
    assert!(fixture.layout.swap_marker_path().is_file());

    let mut service = fixture.service();
    let err = service
        .promote(&fixture.package, "1.8.0", &[])
        .expect_err("pending swap must block promotion");
    assert!(matches!(err, UpgradeError::SwapInProgress { .. }));

    let outcome = service.recover_interrupted_swap().expect("must recover");
    let SwapRecovery::Reversed(marker) = outcome else {
        panic!("expected reversal, got {outcome:?}");
    };
    assert_eq!(marker.operation, SwapOperation::Promote);
    assert_eq!(read_tree(&fixture.live(), &[]), before);
    assert!(!fixture.layout.stage_dir(&marker.manifest_id).exists());
    assert!(!fixture.layout.swap_marker_path().exists());
    assert_eq!(
        service.recover_interrupted_swap().expect("second recovery"),
        SwapRecovery::Clean
    );

    fixture.cleanup();
}

#[test]
fn recovery_completes_promotion_whose_second_rename_happened() {
    let fixture = Fixture::new();
    let layout = &fixture.layout;
    let id = "stage-01J0000000000000000000TEST";
    fs::create_dir_all(layout.staging_root()).expect("must create staging root");
    copy_dir_recursive(&fixture.package, &layout.package_dir(id)).expect("must stage");
    let manifest = sample_manifest(id, layout);
    write_stage_manifest(&layout.stage_manifest_path(id), &manifest).expect("must write");

    fs::rename(layout.root(), layout.backup_dir(id)).expect("must move live aside");
    fs::rename(layout.package_dir(id), layout.root()).expect("must move package live");
    let marker = SwapMarker {
        operation: SwapOperation::Promote,
        manifest_id: id.to_string(),
        live: layout.root().to_path_buf(),
        backup: layout.backup_dir(id),
        package: Some(layout.package_dir(id)),
        aside: None,
        started_at: 1,
    };
    fs::write(
        layout.swap_marker_path(),
        serde_json::to_string(&marker).expect("must encode marker"),
    )
    .expect("must write marker");

    let mut service = fixture.service();
    let outcome = service.recover_interrupted_swap().expect("must recover");
    assert_eq!(outcome, SwapRecovery::Completed(marker));
    assert_eq!(
        service
            .manifest_store()
            .load(id)
            .expect("must load")
            .map(|stored| stored.target_version),
        Some("1.8.0".to_string())
    );
    assert!(!layout.stage_dir(id).exists());
    assert_eq!(
        fs::read_to_string(layout.root().join("index.php")).expect("must read"),
        "<?php // 1.8\n"
    );

    fixture.cleanup();
}

#[test]
fn interrupted_rollback_is_reversed_to_current_live_tree() {
    let fixture = Fixture::new();
    let mut service = fixture.service();
    let promoted = service
        .promote(&fixture.package, "1.8.0", &[])
        .expect("must promote");
    let promoted_tree = read_tree(&fixture.live(), &[]);

    let aside = fixture.layout.aside_dir(&promoted.id, 42);
    fs::rename(fixture.layout.root(), &aside).expect("must rotate live aside");
    let marker = SwapMarker {
        operation: SwapOperation::Rollback,
        manifest_id: promoted.id.clone(),
        live: fixture.layout.root().to_path_buf(),
        backup: promoted.backup_path.clone(),
        package: None,
        aside: Some(aside.clone()),
        started_at: 42,
    };
    fs::write(
        fixture.layout.swap_marker_path(),
        serde_json::to_string_pretty(&marker).expect("must encode marker"),
    )
    .expect("must write marker");

    let outcome = service.recover_interrupted_swap().expect("must recover");
    assert_eq!(outcome, SwapRecovery::Reversed(marker));
    assert_eq!(read_tree(&fixture.live(), &[]), promoted_tree);
    assert!(!aside.exists());
    assert!(promoted.backup_path.is_dir());

    fixture.cleanup();
}

#[test]
fn concurrent_operation_fails_fast_on_lock() {
    let fixture = Fixture::new();
    let layout = &fixture.layout;
    let held = OperationLock::acquire(&layout.lock_path(), "promote", "stage-held")
        .expect("must acquire lock");

    let mut service = fixture.service();
    let err = service
        .promote(&fixture.package, "1.8.0", &[])
        .expect_err("locked promotion must fail");
    match err {
        UpgradeError::OperationLocked { holder } => assert!(holder.contains("stage-held")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        fs::read_to_string(fixture.live().join("index.php")).expect("live untouched"),
        "<?php // 1.7\n"
    );

    drop(held);
    assert!(!layout.lock_path().exists());
    service
        .promote(&fixture.package, "1.8.0", &[])
        .expect("promotion must succeed once the lock is released");

    fixture.cleanup();
}

#[test]
fn stale_lock_can_be_released() {
    let fixture = Fixture::new();
    write_file(&fixture.layout.lock_path(), "rollback stage-x pid=1\n");
    let service = fixture.service();
    let holder = service.release_stale_lock().expect("must release");
    assert_eq!(holder.as_deref(), Some("rollback stage-x pid=1"));
    assert!(!fixture.layout.lock_path().exists());

    fixture.cleanup();
}

#[test]
fn rollback_reports_missing_manifest_and_missing_backup() {
    let fixture = Fixture::new();
    let mut service = fixture.service();
    assert!(service.rollback(None).expect("no manifests is not an error").is_none());
    assert!(service
        .rollback(Some("stage-unknown"))
        .expect("unknown id is not an error")
        .is_none());
    assert!(matches!(
        service.rollback(Some("../escape")),
        Err(UpgradeError::InvalidArgument(_))
    ));

    let manifest = service.create_snapshot(Some("before theme work")).expect("must snapshot");
    fs::remove_dir_all(&manifest.backup_path).expect("must drop backup");
    let err = service
        .rollback(Some(&manifest.id))
        .expect_err("missing backup must fail");
    assert!(matches!(err, UpgradeError::SnapshotUnavailable { .. }));
    assert!(err.is_not_found());
    assert!(!err.is_fatal());

    fixture.cleanup();
}

#[test]
fn manual_snapshot_records_label_and_rolls_back() {
    let fixture = Fixture::new();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink_events = Rc::clone(&events);
    let mut service = fixture
        .service()
        .with_progress(Box::new(move |event: &ProgressEvent| {
            sink_events.borrow_mut().push(event.stage)
        }));

    let live_digest = tree_digest_hex(&fixture.live()).expect("must digest live tree");
    let manifest = service.create_snapshot(Some("  nightly  ")).expect("must snapshot");
    assert_eq!(
        tree_digest_hex(&manifest.backup_path).expect("must digest backup"),
        live_digest
    );
    assert_eq!(manifest.operation, ManifestOperation::Snapshot);
    assert_eq!(manifest.label.as_deref(), Some("nightly"));
    assert_eq!(manifest.target_version, manifest.source_version);
    assert!(manifest.package_path.is_none());
    assert!(manifest.backup_path.join("index.php").is_file());
    assert_eq!(
        events.borrow().as_slice(),
        &[ProgressStage::Snapshot, ProgressStage::Complete]
    );

    write_file(&fixture.live().join("system").join("core.txt"), "edited\n");
    service.rollback(Some(&manifest.id)).expect("must roll back");
    assert_eq!(
        fs::read_to_string(fixture.live().join("system").join("core.txt")).expect("must read"),
        "core 1.7\n"
    );
    assert!(events.borrow().contains(&ProgressStage::Rollback));

    fixture.cleanup();
}

#[test]
fn preflight_reports_pending_updates_and_conflicts() {
    let fixture = Fixture::new();
    let live = fixture.live();
    write_file(
        &live.join("user/config/plugins/beta.yaml"),
        "enabled: false\n",
    );
    write_file(&live.join("user/config/system.yaml"), "pages:\n  theme: quark\n");
    write_file(
        &live.join("user/plugins/alpha/composer.json"),
        r#"{"require": {"psr/log": "^1.0"}}"#,
    );
    write_file(
        &live.join("user/plugins/modern/composer.json"),
        r#"{"require-dev": {"psr/log": "^3.0"}}"#,
    );
    write_file(
        &live.join("user/plugins/beta/composer.json"),
        r#"{"require": {"psr/log": "~2.5"}}"#,
    );
    write_file(&live.join("user/plugins/broken/composer.json"), "not json");

    let registry = StaticRegistry::new()
        .with_package(PackageKind::Plugins, "alpha", PackageInfo::new("2.1.0", "2.2.0"))
        .with_package(PackageKind::Plugins, "beta", PackageInfo::new("1.0.0", "1.1.0"))
        .with_package(
            PackageKind::Plugins,
            "gamma",
            PackageInfo {
                published: Some(false),
                ..PackageInfo::new("1.0.0", "1.0.1")
            },
        )
        .with_package(PackageKind::Themes, "quark", PackageInfo::new("2.0.0", "2.0.1"))
        .with_package(PackageKind::Themes, "other", PackageInfo::new("1.0.0", "1.0.1"));
    let service = SafeUpgradeService::new(
        fixture.layout.clone(),
        UpgradeOptions::default(),
        Dependencies::new(Box::new(registry)),
    );

    let report = service.preflight(Some("1.8.0")).expect("must run preflight");
    assert!(report.is_major_minor_upgrade);
    assert_eq!(
        report.plugins_pending.keys().collect::<Vec<_>>(),
        vec!["alpha", "quark"]
    );
    assert_eq!(report.plugins_pending["quark"].kind, PackageKind::Themes);
    assert_eq!(
        report.dependency_conflicts.keys().collect::<Vec<_>>(),
        vec!["alpha"]
    );
    assert_eq!(report.dependency_conflicts["alpha"].requires, "^1.0");
    assert_eq!(report.warnings.len(), 2);
    assert!(report.warnings[0].contains("major upgrade"));
    assert!(report.warnings[1].contains("psr/log"));
    assert!(report.has_issues());

    let patch = service.preflight(Some("1.7.49")).expect("must run preflight");
    assert!(!patch.is_major_minor_upgrade);
    assert!(patch.warnings[0].starts_with("Pending plugin/theme updates"));

    fixture.cleanup();
}

#[test]
fn preflight_degrades_when_registry_is_unavailable() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let report = service.preflight(None).expect("must still produce a report");
    assert!(report.plugins_pending.is_empty());
    assert!(report.dependency_conflicts.is_empty());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("package registry is not configured"));

    fixture.cleanup();
}

#[test]
fn preflight_flags_deprecated_logger_calls_in_enabled_plugins() {
    let fixture = Fixture::new();
    let live = fixture.live();
    let plugin = live.join("user/plugins/alpha");
    write_file(
        &plugin.join("src/Logger.php"),
        "<?php\n$log->ADDERROR('boom');\n$log->addWarning('later');\n",
    );
    write_file(&plugin.join("alpha.php"), "<?php\n$log->error('psr');\n");
    write_file(&plugin.join("notes.txt"), "$log->addInfo('text');\n");
    write_file(&plugin.join("vendor/monolog/Old.php"), "<?php $log->addDebug('x');\n");
    write_file(&plugin.join("node_modules/pkg/x.php"), "<?php $log->addDebug('x');\n");
    write_file(&plugin.join(".cache/x.php"), "<?php $log->addDebug('x');\n");
    write_file(&live.join("user/plugins/beta/beta.php"), "<?php $log->addAlert('x');\n");
    write_file(&live.join("user/config/plugins/beta.yaml"), "enabled: false\n");
    let registry = StaticRegistry::new();
    let service = SafeUpgradeService::new(
        fixture.layout.clone(),
        UpgradeOptions::default(),
        Dependencies::new(Box::new(registry)),
    );

    let report = service.preflight(None).expect("must run preflight");
    assert_eq!(
        report.deprecated_api_usages.keys().collect::<Vec<_>>(),
        vec!["alpha"]
    );
    let usages = &report.deprecated_api_usages["alpha"];
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].file, Path::new("user/plugins/alpha/src/Logger.php"));
    assert_eq!(usages[0].method, "->ADDERROR(");
    assert_eq!(
        report.warnings,
        vec!["Potential Monolog logger API incompatibilities detected.".to_string()]
    );
    assert!(report.has_issues());

    let disabled = SafeUpgradeService::new(
        fixture.layout.clone(),
        UpgradeOptions {
            deprecated_api_pattern: String::new(),
            ..UpgradeOptions::default()
        },
        Dependencies::new(Box::new(StaticRegistry::new())),
    );
    let report = disabled.preflight(None).expect("must run preflight");
    assert!(report.deprecated_api_usages.is_empty());
    assert!(!report.has_issues());

    fixture.cleanup();
}

#[test]
fn constraint_classification_follows_coarse_rule() {
    for compatible in ["*", "^3.0", ">=3.0", "^4.1", ">= 5.0", "1.0 || ^3.0"] {
        assert!(is_constraint_compatible(compatible), "{compatible}");
    }
    for conflicting in ["^1.0", "~2.5", "1.*", ">=1.0", " * ", "^1.0 "] {
        assert!(!is_constraint_compatible(conflicting), "{conflicting}");
    }
}

#[test]
fn clear_recovery_flag_is_best_effort() {
    let fixture = Fixture::new();
    let service = fixture.service();
    service.clear_recovery_flag();

    let flag = fixture.layout.recovery_flag_path();
    write_file(&flag, "{}");
    service.clear_recovery_flag();
    assert!(!flag.exists());

    fixture.cleanup();
}

#[test]
fn config_rejects_unknown_version_and_unsafe_ignores() {
    let err = parse_config("version = 2\n").expect_err("version 2 must fail");
    assert!(err.to_string().contains("expected 1"));

    let err = parse_config("version = 1\nignored_dirs = [\"cache\"]\n")
        .expect_err("missing user must fail");
    assert!(err.to_string().contains("'user'"));

    let config = parse_config(
        "version = 1\nsnapshot_limit = 5\nstaging_root = \"../staging\"\nshared_library = \"monolog/monolog\"\n",
    )
    .expect("must parse");
    let options = config.options();
    assert_eq!(options.snapshot_limit, 5);
    assert_eq!(options.shared_library, "monolog/monolog");
    assert_eq!(options.declaration_file, "composer.json");
    assert_eq!(options.ignored_dirs.len(), DEFAULT_IGNORED_DIRS.len());
    assert_eq!(options.deprecated_api_library, "Monolog");
    assert_eq!(options.source_extensions, vec!["php".to_string()]);
    assert!(options.deprecated_api_pattern.contains("addDebug"));

    let err = parse_config("version = 1\ndeprecated_api_pattern = \"->add(\"\n")
        .expect_err("broken pattern must fail");
    assert!(format!("{err:#}").contains("deprecated_api_pattern"));
    let scan = parse_config(
        "version = 1\ndeprecated_api_pattern = \"\"\nsource_extensions = [\"php\", \"inc\"]\n",
    )
    .expect("must parse")
    .options();
    assert!(scan.deprecated_api_pattern.is_empty());
    assert_eq!(scan.source_extensions.len(), 2);

    let layout = config.layout(Path::new("/srv/app")).expect("must resolve layout");
    assert_eq!(layout.staging_root(), Path::new("/srv/app/../staging"));
    assert_eq!(
        layout.manifest_store(),
        Path::new("/srv/app/user/data/upgrades")
    );
}

#[test]
fn default_layout_places_staging_beside_live_root() {
    let layout = UpgradeLayout::for_root("/srv/app").expect("must derive layout");
    assert_eq!(layout.staging_root(), Path::new("/srv/.app-safeup"));
    assert_eq!(
        layout.backup_dir("stage-1"),
        Path::new("/srv/.app-safeup/snapshot-stage-1")
    );
    assert_eq!(
        layout.recovery_flag_path(),
        Path::new("/srv/app/user/data/recovery.flag")
    );
    assert!(layout.is_within_staging_root(&layout.lock_path()));
}

struct Fixture {
    base: PathBuf,
    package: PathBuf,
    layout: UpgradeLayout,
}

impl Fixture {
    fn new() -> Self {
        let base = test_root();
        let live = base.join("app");
        write_file(&live.join("VERSION"), "1.7.48\n");
        write_file(&live.join("index.php"), "<?php // 1.7\n");
        write_file(&live.join("system/core.txt"), "core 1.7\n");
        write_file(&live.join("vendor/lib.txt"), "lib 1\n");
        write_file(&live.join("user/accounts/admin.yaml"), "email: admin@example.test\n");
        write_file(
            &live.join("user/plugins/alpha/blueprints.yaml"),
            "name: Alpha\nversion: 2.1.0\n",
        );
        write_file(&live.join("cache/compiled.bin"), "stale");
        write_file(&live.join(".htaccess"), "RewriteEngine On\n");
        write_file(&live.join("media/photo.txt"), "pixels");

        let package = base.join("pkg-1.8.0");
        write_file(&package.join("VERSION"), "1.8.0\n");
        write_file(&package.join("index.php"), "<?php // 1.8\n");
        write_file(&package.join("system/core.txt"), "core 1.8\n");
        write_file(&package.join("vendor/lib.txt"), "lib 2\n");
        write_file(&package.join("cache/shipped.bin"), "should not survive");

        let layout = UpgradeLayout::for_root(&live).expect("must derive layout");
        Self {
            base,
            package,
            layout,
        }
    }

    fn live(&self) -> PathBuf {
        self.layout.root().to_path_buf()
    }

    fn service(&self) -> SafeUpgradeService {
        SafeUpgradeService::new(
            self.layout.clone(),
            UpgradeOptions::default(),
            Dependencies::default(),
        )
    }

    fn cleanup(self) {
        let _ = fs::remove_dir_all(&self.base);
    }
}

/// Delegates to `std::fs` except for the injected failures.
struct FaultyFilesystem {
    fail_package: bool,
    fail_restore: bool,
    empty_root: bool,
}

impl Filesystem for FaultyFilesystem {
    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        let name = from
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        if (self.fail_package && name == "package")
            || (self.fail_restore && name.starts_with("snapshot-"))
        {
            anyhow::bail!("injected rename failure for {}", from.display());
        }
        StdFilesystem.rename(from, to)
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        StdFilesystem.copy_tree(from, to)
    }

    fn remove_tree(&self, path: &Path) -> anyhow::Result<()> {
        StdFilesystem.remove_tree(path)
    }

    fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
        StdFilesystem.create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        StdFilesystem.exists(path)
    }

    fn has_entries(&self, path: &Path) -> bool {
        !self.empty_root && StdFilesystem.has_entries(path)
    }
}

fn sample_manifest(id: &str, layout: &UpgradeLayout) -> UpgradeManifest {
    UpgradeManifest {
        id: id.to_string(),
        created_at: 1,
        source_version: "1.7.48".to_string(),
        target_version: "1.8.0".to_string(),
        runtime_version: "unknown".to_string(),
        package_path: Some(layout.package_dir(id)),
        backup_path: layout.backup_dir(id),
        ignored: strings(&["user"]),
        plugins: BTreeMap::new(),
        operation: ManifestOperation::Upgrade,
        label: None,
        rolled_back_at: None,
    }
}

/// Relative path -> contents of every regular file under `root`, skipping
/// the named top-level entries.
fn read_tree(root: &Path, skip: &[&str]) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("must read dir") {
            let path = entry.expect("must read entry").path();
            let relative = path
                .strip_prefix(root)
                .expect("must be under root")
                .to_string_lossy()
                .replace('\\', "/");
            if dir == root && skip.contains(&relative.as_str()) {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else {
                files.insert(relative, fs::read(&path).expect("must read file"));
            }
        }
    }
    files
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent");
    }
    fs::write(path, contents).expect("must write file");
}

fn test_root() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "safeup-upgrade-test-{}-{nanos}-{seq}",
        std::process::id()
    ))
}
