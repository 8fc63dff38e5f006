//! Retention policy tests: catalog CRUD and cleanup computation.

use catalog::{
    xlog, BackupCatalog, BasebackupCleanupMode, BaseBackupDescr, CatalogDescr, CatalogTag,
    ConnectionType, PinDescr, PinOperation, RetentionDescr, RetentionRuleDescr, RetentionRuleId,
};

fn scratch_catalog() -> (tempfile::TempDir, BackupCatalog) {
    let dir = tempfile::tempdir().unwrap();
    let mut cat = BackupCatalog::new(dir.path().join("catalog.db"));
    cat.open_rw().unwrap();
    (dir, cat)
}

fn make_archive(cat: &BackupCatalog, name: &str) -> CatalogDescr {
    let mut descr = CatalogDescr::new(CatalogTag::CreateArchive);
    descr.archive_name = name.to_string();
    descr.directory = format!("/tmp/{name}");
    descr.coninfo.contype = ConnectionType::Basebackup;
    cat.create_archive(&mut descr).unwrap();
    cat.create_catalog_connection(&descr.coninfo).unwrap();
    descr
}

fn ready_backup_started_at(
    cat: &BackupCatalog,
    archive_id: i64,
    label: &str,
    started: &str,
    xlogpos: &str,
    xlogposend: &str,
) -> BaseBackupDescr {
    let mut backup = BaseBackupDescr::new();
    backup.label = label.to_string();
    backup.started = started.to_string();
    backup.xlogpos = xlogpos.to_string();
    backup.timeline = 1;
    backup.wal_segment_size = 16 * 1024 * 1024;
    cat.register_basebackup(archive_id, &mut backup).unwrap();
    backup.xlogposend = xlogposend.to_string();
    cat.finalize_basebackup(&mut backup).unwrap();
    backup
}

#[test]
fn policy_crud_round_trip() {
    let (_dir, cat) = scratch_catalog();

    let mut policy = RetentionDescr::new();
    policy.name = "weekly".to_string();
    policy
        .rules
        .push(RetentionRuleDescr::new(RetentionRuleId::KeepNum, "4"));
    policy.rules.push(RetentionRuleDescr::new(
        RetentionRuleId::DropOlderByDatetime,
        "30 days",
    ));
    cat.create_retention_policy(&mut policy).unwrap();
    assert!(policy.id >= 0);

    let found = cat.get_retention_policy("weekly").unwrap();
    assert_eq!(found.id, policy.id);
    assert_eq!(found.rules.len(), 2);
    assert_eq!(found.rules[0].rule_type, RetentionRuleId::KeepNum);
    assert_eq!(found.rules[1].value, "30 days");
    assert!(!found.created.is_empty());

    assert_eq!(cat.get_retention_policies().unwrap().len(), 1);

    cat.drop_retention_policy("weekly").unwrap();
    assert!(cat.get_retention_policy("weekly").unwrap().id < 0);
}

#[test]
fn policy_without_rules_is_rejected() {
    let (_dir, cat) = scratch_catalog();
    let mut empty = RetentionDescr::new();
    empty.name = "void".to_string();
    assert!(cat.create_retention_policy(&mut empty).is_err());
}

#[test]
fn drop_older_respects_pins_and_drags_wal_boundary() {
    let (_dir, cat) = scratch_catalog();
    let archive = make_archive(&cat, "pg1");

    // Three finished backups, all older than the one-day horizon; b1 is
    // the newest and pinned.
    let b1 = ready_backup_started_at(
        &cat,
        archive.id,
        "b1",
        "2024-01-03 00:00:00",
        "0/3000000",
        "0/3100000",
    );
    let b2 = ready_backup_started_at(
        &cat,
        archive.id,
        "b2",
        "2024-01-02 00:00:00",
        "0/2000000",
        "0/2100000",
    );
    let b3 = ready_backup_started_at(
        &cat,
        archive.id,
        "b3",
        "2024-01-01 00:00:00",
        "0/1000000",
        "0/1100000",
    );

    let pin = PinDescr::new(CatalogTag::PinBasebackup, PinOperation::Id(b1.id)).unwrap();
    cat.perform_pin_action(archive.id, &pin).unwrap();

    let mut policy = RetentionDescr::new();
    policy.name = "horizon".to_string();
    policy.rules.push(RetentionRuleDescr::new(
        RetentionRuleId::DropOlderByDatetime,
        "1 days",
    ));
    cat.create_retention_policy(&mut policy).unwrap();

    let cleanup = cat.apply_retention_policy("pg1", "horizon").unwrap();

    // Newest first, pinned backup kept, the others elected.
    assert_eq!(cleanup.basebackups.len(), 3);
    assert_eq!(cleanup.basebackups[0].backup.id, b1.id);
    assert_eq!(cleanup.basebackups[0].mode, BasebackupCleanupMode::Keep);
    assert_eq!(cleanup.basebackups[1].backup.id, b2.id);
    assert_eq!(cleanup.basebackups[1].mode, BasebackupCleanupMode::Delete);
    assert_eq!(cleanup.basebackups[2].backup.id, b3.id);
    assert_eq!(cleanup.basebackups[2].mode, BasebackupCleanupMode::Delete);

    // The pinned backup drags the WAL boundary: eviction must stop at or
    // before its start position.
    let off = cleanup.off_list.get(&1).unwrap();
    let b1_start = xlog::parse_xlog_pos(&b1.xlogpos).unwrap();
    assert!(off.wal_cleanup_end_pos <= b1_start);
    assert_eq!(
        off.wal_cleanup_start_pos,
        xlog::parse_xlog_pos(&b3.xlogpos).unwrap()
    );
}

#[test]
fn keep_num_elects_the_old_tail() {
    let (_dir, cat) = scratch_catalog();
    let archive = make_archive(&cat, "pg1");

    for (i, day) in ["04", "03", "02", "01"].iter().enumerate() {
        ready_backup_started_at(
            &cat,
            archive.id,
            &format!("b{i}"),
            &format!("2024-01-{day} 00:00:00"),
            &format!("0/{}000000", 4 - i),
            &format!("0/{}100000", 4 - i),
        );
    }

    let mut policy = RetentionDescr::new();
    policy.name = "keep2".to_string();
    policy
        .rules
        .push(RetentionRuleDescr::new(RetentionRuleId::KeepNum, "2"));
    cat.create_retention_policy(&mut policy).unwrap();

    let cleanup = cat.apply_retention_policy("pg1", "keep2").unwrap();
    let modes: Vec<_> = cleanup.basebackups.iter().map(|i| i.mode).collect();
    assert_eq!(
        modes,
        vec![
            BasebackupCleanupMode::Keep,
            BasebackupCleanupMode::Keep,
            BasebackupCleanupMode::Delete,
            BasebackupCleanupMode::Delete,
        ]
    );
}

#[test]
fn in_progress_backups_are_never_elected() {
    let (_dir, cat) = scratch_catalog();
    let archive = make_archive(&cat, "pg1");

    let mut running = BaseBackupDescr::new();
    running.started = "2020-01-01 00:00:00".to_string();
    running.xlogpos = "0/1000000".to_string();
    running.timeline = 1;
    cat.register_basebackup(archive.id, &mut running).unwrap();

    let mut policy = RetentionDescr::new();
    policy.name = "horizon".to_string();
    policy.rules.push(RetentionRuleDescr::new(
        RetentionRuleId::DropOlderByDatetime,
        "1 days",
    ));
    cat.create_retention_policy(&mut policy).unwrap();

    let cleanup = cat.apply_retention_policy("pg1", "horizon").unwrap();
    assert_eq!(cleanup.basebackups[0].mode, BasebackupCleanupMode::Keep);
}

#[test]
fn apply_names_missing_resources() {
    let (_dir, cat) = scratch_catalog();
    make_archive(&cat, "pg1");

    let err = cat.apply_retention_policy("pg1", "nope").unwrap_err();
    assert!(err.to_string().contains("nope"));

    let err = cat.apply_retention_policy("ghost", "nope").unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
