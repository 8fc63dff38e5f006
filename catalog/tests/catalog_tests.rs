//! Catalog store tests: lifecycle, sentinel lookups, partial updates and
//! cascading drops against a scratch catalog.

use catalog::{
    ArchiveAttr, BackupCatalog, BackupCompressType, BackupProfileDescr, BackupStatus,
    BackupTablespaceDescr, BaseBackupDescr, CatalogDescr, CatalogTag, ConnectionDescr,
    ConnectionType, PinDescr, PinOperation, ProfileAttr,
};

fn scratch_catalog() -> (tempfile::TempDir, BackupCatalog) {
    let dir = tempfile::tempdir().unwrap();
    let mut cat = BackupCatalog::new(dir.path().join("catalog.db"));
    cat.open_rw().unwrap();
    (dir, cat)
}

fn make_archive(cat: &BackupCatalog, name: &str, directory: &str) -> CatalogDescr {
    let mut descr = CatalogDescr::new(CatalogTag::CreateArchive);
    descr.archive_name = name.to_string();
    descr.directory = directory.to_string();
    descr.coninfo.contype = ConnectionType::Basebackup;
    descr.coninfo.pghost = "localhost".to_string();
    descr.coninfo.pgport = 5432;
    descr.coninfo.pguser = "repl".to_string();
    descr.coninfo.pgdatabase = "postgres".to_string();
    cat.create_archive(&mut descr).unwrap();
    cat.create_catalog_connection(&descr.coninfo).unwrap();
    descr
}

fn make_ready_backup(
    cat: &BackupCatalog,
    archive_id: i64,
    label: &str,
    xlogpos: &str,
    xlogposend: &str,
) -> BaseBackupDescr {
    let mut backup = BaseBackupDescr::new();
    backup.label = label.to_string();
    backup.xlogpos = xlogpos.to_string();
    backup.timeline = 1;
    backup.wal_segment_size = 16 * 1024 * 1024;
    cat.register_basebackup(archive_id, &mut backup).unwrap();
    backup.xlogposend = xlogposend.to_string();
    cat.finalize_basebackup(&mut backup).unwrap();
    backup
}

#[test]
fn open_is_idempotent_and_seeds_default_profile() {
    let (_dir, mut cat) = scratch_catalog();
    cat.open_rw().unwrap();
    assert!(cat.available());

    // The reserved default profile is always resolvable in a fresh
    // catalog.
    let default = cat.get_backup_profile("default").unwrap();
    assert!(default.profile_id >= 0);
    assert_eq!(default.compress_type, BackupCompressType::None);

    cat.close();
    assert!(!cat.available());
}

#[test]
fn create_archive_round_trip() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");
    assert!(descr.id >= 0);

    let found = cat.exists_by_name("pg1").unwrap();
    assert_eq!(found.id, descr.id);
    assert_eq!(found.directory, "/tmp/pg1");

    let by_dir = cat.exists("/tmp/pg1").unwrap();
    assert_eq!(by_dir.id, descr.id);

    // Sentinel contract: absent archives come back with id < 0.
    assert!(cat.exists_by_name("nope").unwrap().id < 0);
    assert!(cat.exists("/tmp/nope").unwrap().id < 0);
}

#[test]
fn transactions_are_non_reentrant() {
    let (_dir, mut cat) = scratch_catalog();
    cat.start_transaction().unwrap();
    assert!(cat.start_transaction().is_err());
    cat.commit().unwrap();
    assert!(cat.commit().is_err());
    assert!(cat.rollback().is_err());
}

#[test]
fn rollback_discards_archive() {
    let (_dir, mut cat) = scratch_catalog();
    cat.start_transaction().unwrap();
    make_archive(&cat, "gone", "/tmp/gone");
    cat.rollback().unwrap();

    assert!(cat.exists_by_name("gone").unwrap().id < 0);
}

#[test]
fn empty_attribute_set_update_is_a_noop() {
    let (_dir, cat) = scratch_catalog();
    let mut descr = make_archive(&cat, "pg1", "/tmp/pg1");

    descr.archive_name = "changed".to_string();
    descr.attrs.clear();
    cat.update_archive_attributes(&descr, &descr.attrs.clone())
        .unwrap();

    // No column was touched.
    assert!(cat.exists_by_name("pg1").unwrap().id >= 0);
    assert!(cat.exists_by_name("changed").unwrap().id < 0);
}

#[test]
fn partial_update_touches_exactly_the_named_columns() {
    let (_dir, cat) = scratch_catalog();
    let mut descr = make_archive(&cat, "pg1", "/tmp/pg1");

    descr.archive_name = "renamed".to_string();
    descr.compression = true;
    descr.attrs.clear();
    descr.attrs.push(ArchiveAttr::Name);
    cat.update_archive_attributes(&descr, &descr.attrs.clone())
        .unwrap();

    let found = cat.exists_by_name("renamed").unwrap();
    assert!(found.id >= 0);
    // Compression was not in the affected set and keeps its old value.
    assert!(!found.compression);
}

#[test]
fn drop_archive_cascades_without_orphans() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut backup = BaseBackupDescr::new();
    cat.register_basebackup(descr.id, &mut backup).unwrap();

    let mut spc = BackupTablespaceDescr::new();
    spc.backup_id = backup.id;
    spc.spcoid = 1663;
    spc.spcsize = 1024;
    cat.register_tablespace_for_backup(&mut spc).unwrap();

    cat.drop_archive("pg1").unwrap();

    assert!(cat.exists_by_name("pg1").unwrap().id < 0);
    assert!(cat.get_catalog_connections(descr.id).unwrap().is_empty());
    assert!(cat.get_backup_list(descr.id).unwrap().is_empty());
}

#[test]
fn connection_lookup_fills_provided_descriptor() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut con = ConnectionDescr::new();
    cat.get_catalog_connection_into(&mut con, descr.id, ConnectionType::Basebackup)
        .unwrap();
    assert_eq!(con.archive_id, descr.id);
    assert_eq!(con.pghost, "localhost");
    assert_eq!(con.pgport, 5432);

    // Absence resets the archive id sentinel on the provided handle.
    let mut missing = ConnectionDescr::new();
    missing.archive_id = 42;
    cat.get_catalog_connection_into(&mut missing, descr.id, ConnectionType::Streamer)
        .unwrap();
    assert_eq!(missing.archive_id, -1);
}

#[test]
fn drop_connection_is_type_specific() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut streamer = ConnectionDescr::new();
    streamer.archive_id = descr.id;
    streamer.contype = ConnectionType::Streamer;
    streamer.pghost = "stream.example".to_string();
    cat.create_catalog_connection(&streamer).unwrap();

    assert_eq!(cat.get_catalog_connections(descr.id).unwrap().len(), 2);

    cat.drop_catalog_connection("pg1", ConnectionType::Streamer)
        .unwrap();

    let remaining = cat.get_catalog_connections(descr.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].contype, ConnectionType::Basebackup);
}

#[test]
fn connections_are_ordered_by_type() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut streamer = ConnectionDescr::new();
    streamer.archive_id = descr.id;
    streamer.contype = ConnectionType::Streamer;
    cat.create_catalog_connection(&streamer).unwrap();

    let cons = cat.get_catalog_connections(descr.id).unwrap();
    assert_eq!(cons[0].contype, ConnectionType::Basebackup);
    assert_eq!(cons[1].contype, ConnectionType::Streamer);
}

#[test]
fn duplicate_connection_type_is_rejected() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut dup = ConnectionDescr::new();
    dup.archive_id = descr.id;
    dup.contype = ConnectionType::Basebackup;
    assert!(cat.create_catalog_connection(&dup).is_err());
}

#[test]
fn profile_round_trip_on_compared_fields() {
    let (_dir, cat) = scratch_catalog();

    let mut profile = BackupProfileDescr::new();
    profile.name = "nightly".to_string();
    profile.compress_type = BackupCompressType::Gzip;
    profile.max_rate = 2048;
    profile.label = "nightly base".to_string();
    profile.fast_checkpoint = true;
    profile.include_wal = true;
    profile.wait_for_wal = false;
    profile.attrs.set(ProfileAttr::required_for_create());
    cat.create_backup_profile(&mut profile).unwrap();
    assert!(profile.profile_id >= 0);

    let found = cat.get_backup_profile("nightly").unwrap();
    assert_eq!(found.name, profile.name);
    assert_eq!(found.compress_type, profile.compress_type);
    assert_eq!(found.max_rate, profile.max_rate);
    assert_eq!(found.label, profile.label);
    assert_eq!(found.fast_checkpoint, profile.fast_checkpoint);
    assert_eq!(found.include_wal, profile.include_wal);
    assert_eq!(found.wait_for_wal, profile.wait_for_wal);

    // Sentinel for absent profiles.
    assert!(cat.get_backup_profile("absent").unwrap().profile_id < 0);

    // UNIQUE name constraint.
    let mut dup = BackupProfileDescr::new();
    dup.name = "nightly".to_string();
    assert!(cat.create_backup_profile(&mut dup).is_err());

    cat.drop_backup_profile("nightly").unwrap();
    assert!(cat.get_backup_profile("nightly").unwrap().profile_id < 0);
}

#[test]
fn basebackup_lifecycle_finalize() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let backup = make_ready_backup(&cat, descr.id, "b1", "0/1000060", "0/2000000");
    assert!(backup.id >= 0);

    let list = cat.get_backup_list(descr.id).unwrap();
    assert_eq!(list.len(), 1);
    let row = &list[0];
    assert_eq!(row.status, BackupStatus::Ready);
    assert_eq!(row.xlogposend, "0/2000000");
    assert!(row.stopped >= row.started);
}

#[test]
fn basebackup_lifecycle_abort_leaves_stopped_unset() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut backup = BaseBackupDescr::new();
    cat.register_basebackup(descr.id, &mut backup).unwrap();
    cat.abort_basebackup(&backup).unwrap();

    let list = cat.get_backup_list(descr.id).unwrap();
    assert_eq!(list[0].status, BackupStatus::Aborted);
    assert!(list[0].stopped.is_empty());

    // finalize is only legal from in progress.
    assert!(cat.finalize_basebackup(&mut backup).is_err());
}

#[test]
fn tablespace_registration_requires_backup_id() {
    let (_dir, cat) = scratch_catalog();

    let mut spc = BackupTablespaceDescr::new();
    assert!(cat.register_tablespace_for_backup(&mut spc).is_err());
}

#[test]
fn pin_and_unpin_actions() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let b1 = make_ready_backup(&cat, descr.id, "b1", "0/1000000", "0/1100000");
    let _b2 = make_ready_backup(&cat, descr.id, "b2", "0/2000000", "0/2100000");

    let pin = PinDescr::new(CatalogTag::PinBasebackup, PinOperation::Id(b1.id)).unwrap();
    assert_eq!(cat.perform_pin_action(descr.id, &pin).unwrap(), 1);

    let pin_newest = PinDescr::new(CatalogTag::PinBasebackup, PinOperation::Newest).unwrap();
    cat.perform_pin_action(descr.id, &pin_newest).unwrap();

    let pinned: Vec<i64> = cat
        .get_backup_list(descr.id)
        .unwrap()
        .iter()
        .map(|b| b.pinned)
        .collect();
    assert_eq!(pinned.iter().sum::<i64>(), 2);

    let unpin_all = PinDescr::new(CatalogTag::UnpinBasebackup, PinOperation::Pinned).unwrap();
    assert_eq!(cat.perform_pin_action(descr.id, &unpin_all).unwrap(), 2);

    let pinned_after: i64 = cat
        .get_backup_list(descr.id)
        .unwrap()
        .iter()
        .map(|b| b.pinned)
        .sum();
    assert_eq!(pinned_after, 0);

    // PINNED is rejected for PIN actions at construction time.
    assert!(PinDescr::new(CatalogTag::PinBasebackup, PinOperation::Pinned).is_err());

    // Unknown backup ids surface an archive error.
    let bad = PinDescr::new(CatalogTag::PinBasebackup, PinOperation::Id(9999)).unwrap();
    assert!(cat.perform_pin_action(descr.id, &bad).is_err());
}

#[test]
fn stat_catalog_aggregates() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let ready = make_ready_backup(&cat, descr.id, "b1", "0/1000000", "0/1100000");
    let mut spc = BackupTablespaceDescr::new();
    spc.backup_id = ready.id;
    spc.spcsize = 4096;
    cat.register_tablespace_for_backup(&mut spc).unwrap();

    let mut aborted = BaseBackupDescr::new();
    cat.register_basebackup(descr.id, &mut aborted).unwrap();
    cat.abort_basebackup(&aborted).unwrap();

    let mut running = BaseBackupDescr::new();
    cat.register_basebackup(descr.id, &mut running).unwrap();

    let stat = cat.stat_catalog("pg1").unwrap();
    assert_eq!(stat.archive_name, "pg1");
    assert_eq!(stat.number_of_backups, 3);
    assert_eq!(stat.backups_failed, 1);
    assert_eq!(stat.backups_running, 1);
    assert_eq!(stat.estimated_total_size, 4096);
    assert!(!stat.latest_finished.is_empty());

    assert!(cat.stat_catalog("missing").is_err());
}

#[test]
fn backup_list_is_newest_first() {
    let (_dir, cat) = scratch_catalog();
    let descr = make_archive(&cat, "pg1", "/tmp/pg1");

    let mut old = BaseBackupDescr::new();
    old.started = "2024-01-01 00:00:00".to_string();
    cat.register_basebackup(descr.id, &mut old).unwrap();

    let mut new = BaseBackupDescr::new();
    new.started = "2025-01-01 00:00:00".to_string();
    cat.register_basebackup(descr.id, &mut new).unwrap();

    let list = cat.get_backup_list(descr.id).unwrap();
    assert_eq!(list[0].id, new.id);
    assert_eq!(list[1].id, old.id);
}
