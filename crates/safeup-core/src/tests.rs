use super::*;
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[test]
fn manifest_round_trip_keeps_optional_fields_absent() {
    let manifest = UpgradeManifest {
        id: "stage-01HZX0000000000000000000AA".to_string(),
        created_at: 1_771_001_234,
        source_version: "1.7.48".to_string(),
        target_version: "1.8.0".to_string(),
        runtime_version: "8.3.1".to_string(),
        package_path: Some("/srv/.app-safeup/stage/package".into()),
        backup_path: "/srv/.app-safeup/snapshot-stage".into(),
        ignored: vec!["user".to_string(), "cache".to_string()],
        plugins: Default::default(),
        operation: ManifestOperation::Upgrade,
        label: None,
        rolled_back_at: None,
    };

    let raw = manifest.to_json_pretty().expect("must serialize");
    assert!(!raw.contains("rolled_back_at"));
    assert!(raw.contains("\"operation\": \"upgrade\""));

    let parsed = UpgradeManifest::from_json_str(&raw).expect("must parse");
    assert_eq!(parsed, manifest);
    assert!(!parsed.is_rolled_back());
}

#[test]
fn manifest_parse_accepts_legacy_runtime_field_and_unknown_keys() {
    let raw = r#"{
        "id": "stage-abc",
        "created_at": 10,
        "source_version": "1.7.0",
        "target_version": "1.7.1",
        "php_version": "8.2.0",
        "backup_path": "/tmp/snapshot-stage-abc",
        "entries": ["system", "vendor"],
        "rolled_back_at": 20
    }"#;
    let parsed = UpgradeManifest::from_json_str(raw).expect("must parse");
    assert_eq!(parsed.runtime_version, "8.2.0");
    assert_eq!(parsed.package_path, None);
    assert_eq!(parsed.rolled_back_at, Some(20));
    assert_eq!(parsed.operation, ManifestOperation::Upgrade);
}

#[test]
fn manifest_parse_rejects_blank_id() {
    let raw = r#"{"id":" ","created_at":1,"source_version":"a","target_version":"b","backup_path":"/x"}"#;
    let err = UpgradeManifest::from_json_str(raw).expect_err("blank id must fail");
    assert!(err.to_string().contains("must not be empty"));
}

#[test]
fn report_serializes_pending_kind_as_type() {
    let mut report = PreflightReport::default();
    assert!(!report.has_issues());

    report.plugins_pending.insert(
        "alpha".to_string(),
        PendingUpdate {
            kind: PackageKind::Plugins,
            current: Some("1.0.0".to_string()),
            available: Some("1.1.0".to_string()),
        },
    );
    let raw = serde_json::to_string(&report).expect("must serialize");
    assert!(raw.contains("\"type\":\"plugins\""));
    assert!(report.has_issues());
}

#[test]
fn stage_ids_sort_in_creation_order() {
    let mut generator = StageIdGenerator::new();
    let at = UNIX_EPOCH + Duration::from_secs(1_771_001_234);
    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(generator.next_id("stage", at).expect("must generate"));
    }
    ids.push(
        generator
            .next_id("stage", at + Duration::from_secs(1))
            .expect("must generate"),
    );

    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(sorted, ids);
    assert!(ids.iter().all(|id| id.starts_with("stage-")));
    assert!(generator.next_id("stage", SystemTime::now()).is_ok());
}

#[test]
fn major_minor_handles_loose_versions() {
    assert_eq!(major_minor("1.8.0"), (1, 8));
    assert_eq!(major_minor("v1.7.48"), (1, 7));
    assert_eq!(major_minor("1.8.0-beta.3"), (1, 8));
    assert_eq!(major_minor("2"), (2, 0));
    assert_eq!(major_minor("unknown"), (0, 0));
    assert!(is_major_minor_change("1.7.48", "1.8.0"));
    assert!(!is_major_minor_change("1.7.48", "1.7.49"));
}

#[test]
fn nested_get_walks_objects_and_arrays() {
    let value = json!({
        "access": {"admin": {"login": true}},
        "groups": ["editors", "admins"],
        "nothing": null
    });

    assert_eq!(
        get_nested(&value, "access.admin.login", DEFAULT_SEPARATOR),
        Some(&json!(true))
    );
    assert_eq!(
        get_nested(&value, "groups.1", DEFAULT_SEPARATOR),
        Some(&json!("admins"))
    );
    assert!(has_nested(&value, "nothing", DEFAULT_SEPARATOR));
    assert!(!has_nested(&value, "access.site", DEFAULT_SEPARATOR));
    assert_eq!(get_nested(&value, "groups.x", DEFAULT_SEPARATOR), None);
    assert_eq!(get_nested(&value, "access/admin", '/'), Some(&json!({"login": true})));
}

#[test]
fn nested_set_creates_intermediate_objects() {
    let mut value = json!({"state": "enabled", "access": null});
    set_nested(&mut value, "access.site.login", json!(true), DEFAULT_SEPARATOR)
        .expect("must set through null");
    set_nested(&mut value, "profile.language", json!("en"), DEFAULT_SEPARATOR)
        .expect("must create missing parents");

    assert_eq!(
        value,
        json!({
            "state": "enabled",
            "access": {"site": {"login": true}},
            "profile": {"language": "en"}
        })
    );

    let err = set_nested(&mut value, "state.flag", json!(1), DEFAULT_SEPARATOR)
        .expect_err("must refuse to descend through scalars");
    assert!(err.to_string().contains("non-object value"));
}

#[test]
fn nested_unset_and_def() {
    let mut value = json!({"access": {"site": {"login": true, "api": false}}});
    let removed = unset_nested(&mut value, "access.site.api", DEFAULT_SEPARATOR)
        .expect("must unset");
    assert_eq!(removed, Some(json!(false)));
    assert_eq!(
        unset_nested(&mut value, "missing.path", DEFAULT_SEPARATOR).expect("missing is ok"),
        None
    );

    def_nested(&mut value, "access.site.login", json!(false), DEFAULT_SEPARATOR)
        .expect("must keep existing");
    def_nested(&mut value, "title", json!("Editor"), DEFAULT_SEPARATOR).expect("must default");
    assert_eq!(
        value,
        json!({"access": {"site": {"login": true}}, "title": "Editor"})
    );
}
