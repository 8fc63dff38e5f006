//! End-to-end orchestration tests for START BASEBACKUP with a scripted
//! replication stream: the finalize path and the compensating abort path.

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use catalog::{
    BackupCatalog, BackupProfileDescr, BackupStatus, BackupTablespaceDescr, BaseBackupDescr,
    CatalogDescr, CatalogTag, ConnectionType, StreamIdentification,
};
use pgbunker::commands::archive::CreateArchiveCommand;
use pgbunker::commands::basebackup::StartBasebackupCommand;
use pgbunker::commands::CatalogCommand;
use stream::error::{Result as StreamResult, StreamError};
use stream::pgstream::ReplicationStream;

/// A scripted replication stream serving fixed tablespace payloads, with
/// an optional injected failure mid-stream.
struct MockStream {
    fail_mid_stream: bool,
    tablespaces: VecDeque<BackupTablespaceDescr>,
    chunks: VecDeque<Vec<u8>>,
}

impl MockStream {
    fn healthy() -> Self {
        let mut spc = BackupTablespaceDescr::new();
        spc.spcoid = 1663;
        spc.spclocation = "/var/lib/postgresql/ts1".to_string();
        spc.spcsize = 8192;

        Self {
            fail_mid_stream: false,
            tablespaces: VecDeque::from([BackupTablespaceDescr::new(), spc]),
            chunks: VecDeque::from([b"tablespace payload".to_vec()]),
        }
    }

    fn failing() -> Self {
        let mut mock = Self::healthy();
        mock.fail_mid_stream = true;
        mock
    }
}

#[async_trait]
impl ReplicationStream for MockStream {
    async fn connect(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn identify(&mut self) -> StreamResult<StreamIdentification> {
        let mut ident = StreamIdentification::new();
        ident.systemid = "7000000000000000001".to_string();
        ident.timeline = 1;
        ident.xlogpos = "0/1000060".to_string();
        ident.wal_segment_size = 16 * 1024 * 1024;
        Ok(ident)
    }

    async fn start_backup(&mut self, profile: &BackupProfileDescr) -> StreamResult<BaseBackupDescr> {
        let mut backup = BaseBackupDescr::new();
        backup.label = profile.label.clone();
        backup.xlogpos = "0/1000060".to_string();
        backup.timeline = 1;
        backup.systemid = "7000000000000000001".to_string();
        backup.wal_segment_size = 16 * 1024 * 1024;
        backup.used_profile = profile.profile_id;
        Ok(backup)
    }

    async fn read_tablespace_info(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn step_tablespace(&mut self) -> StreamResult<Option<BackupTablespaceDescr>> {
        Ok(self.tablespaces.pop_front())
    }

    async fn next_chunk(&mut self) -> StreamResult<Option<Bytes>> {
        if self.fail_mid_stream {
            return Err(StreamError::Basebackup(
                "connection reset during COPY".to_string(),
            ));
        }
        Ok(self.chunks.pop_front().map(Bytes::from))
    }

    async fn end_backup(&mut self) -> StreamResult<String> {
        Ok("0/2000000".to_string())
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    catalog: BackupCatalog,
    archive_dir: PathBuf,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let archive_dir = dir.path().join("archive");
    let mut catalog = BackupCatalog::new(dir.path().join("catalog.db"));

    let mut descr = CatalogDescr::new(CatalogTag::CreateArchive);
    descr.archive_name = "pg1".to_string();
    descr.directory = archive_dir.display().to_string();
    descr.coninfo.contype = ConnectionType::Basebackup;
    descr.coninfo.pghost = "localhost".to_string();
    descr.coninfo.pgport = 5432;
    descr.coninfo.pguser = "repl".to_string();
    descr.coninfo.pgdatabase = "postgres".to_string();

    let mut create = CreateArchiveCommand::from_descr(&descr);
    create.execute(&mut catalog, false).await.unwrap();

    Fixture {
        _dir: dir,
        catalog,
        archive_dir,
    }
}

fn start_descr() -> CatalogDescr {
    let mut descr = CatalogDescr::new(CatalogTag::StartBasebackup);
    descr.archive_name = "pg1".to_string();
    descr
}

#[tokio::test]
async fn successful_run_finalizes_the_backup() {
    let mut fx = fixture().await;

    let mut command =
        StartBasebackupCommand::with_stream(&start_descr(), Box::new(MockStream::healthy()));
    command.execute(&mut fx.catalog, false).await.unwrap();

    let archive = fx.catalog.exists_by_name("pg1").unwrap();
    let backups = fx.catalog.get_backup_list(archive.id).unwrap();
    assert_eq!(backups.len(), 1);

    let backup = &backups[0];
    assert_eq!(backup.status, BackupStatus::Ready);
    assert_eq!(backup.xlogpos, "0/1000060");
    assert_eq!(backup.xlogposend, "0/2000000");
    assert!(backup.stopped >= backup.started);
    assert_eq!(backup.tablespaces.len(), 2);
    assert_eq!(backup.tablespaces[1].spcoid, 1663);

    // The on-disk layout: a timestamped directory under the archive root
    // with the magic marker and one archive file per tablespace.
    let backup_dir = PathBuf::from(&backup.fsentry);
    assert!(backup_dir.starts_with(&fx.archive_dir));
    assert!(backup_dir.join("PG_BACKUP_CTL_MAGIC").is_file());
    assert_eq!(
        std::fs::read(backup_dir.join("base-0.tar")).unwrap(),
        b"tablespace payload"
    );
}

#[tokio::test]
async fn mid_stream_failure_aborts_the_registered_backup() {
    let mut fx = fixture().await;

    let mut command =
        StartBasebackupCommand::with_stream(&start_descr(), Box::new(MockStream::failing()));
    let err = command.execute(&mut fx.catalog, false).await.unwrap_err();

    // The original stream error reaches the caller unmasked.
    assert!(err.to_string().contains("connection reset"));

    let archive = fx.catalog.exists_by_name("pg1").unwrap();
    let backups = fx.catalog.get_backup_list(archive.id).unwrap();
    assert_eq!(backups.len(), 1);

    // Registered, then compensated: aborted with stopped unset. No
    // backup is left in progress after a completed command.
    assert_eq!(backups[0].status, BackupStatus::Aborted);
    assert!(backups[0].stopped.is_empty());
}

#[tokio::test]
async fn missing_archive_fails_before_any_catalog_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = BackupCatalog::new(dir.path().join("catalog.db"));

    let mut descr = start_descr();
    descr.archive_name = "ghost".to_string();

    let mut command = StartBasebackupCommand::with_stream(&descr, Box::new(MockStream::healthy()));
    let err = command.execute(&mut catalog, false).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn missing_profile_is_reported_by_name() {
    let mut fx = fixture().await;

    let mut descr = start_descr();
    descr.backup_profile.name = "turbo".to_string();

    let mut command = StartBasebackupCommand::with_stream(&descr, Box::new(MockStream::healthy()));
    let err = command.execute(&mut fx.catalog, false).await.unwrap_err();
    assert!(err.to_string().contains("turbo"));

    // Nothing was registered.
    let archive = fx.catalog.exists_by_name("pg1").unwrap();
    assert!(fx.catalog.get_backup_list(archive.id).unwrap().is_empty());
}
