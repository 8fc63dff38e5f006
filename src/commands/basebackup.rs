//! Basebackup commands: the streaming orchestrator, the catalog listing
//! and pin/unpin.

use async_trait::async_trait;
use log::{debug, info};

use catalog::stat::make_header;
use catalog::{
    BackupCatalog, BackupProfileDescr, BaseBackupDescr, CatalogDescr, CatalogError, CatalogTag,
    ConnectionAttr, ConnectionType, PinDescr,
};
use stream::pgstream::{PgStream, ReplicationStream};
use stream::writer::StreamBackupWriter;

use super::{ensure_open, resolve_archive, rollback_guard, with_transaction, CatalogCommand};
use crate::error::{BunkerError, Result};

pub struct StartBasebackupCommand {
    descr: CatalogDescr,
    stream_override: Option<Box<dyn ReplicationStream>>,
}

impl StartBasebackupCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self {
            descr: own,
            stream_override: None,
        }
    }

    /// Replaces the production replication stream, used by tests to
    /// exercise the orchestration sequence without a server.
    pub fn with_stream(descr: &CatalogDescr, stream: Box<dyn ReplicationStream>) -> Self {
        let mut command = Self::from_descr(descr);
        command.stream_override = Some(stream);
        command
    }
}

#[async_trait(?Send)]
impl CatalogCommand for StartBasebackupCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::StartBasebackup
    }

    /// `background` is an advisory hint for the worker launcher; the
    /// orchestration sequence is identical either way.
    async fn execute(&mut self, catalog: &mut BackupCatalog, _background: bool) -> Result<()> {
        ensure_open(catalog)?;

        // Resolve the archive and load its basebackup connection. The
        // name lookup does not retrieve connection fields by itself.
        let archive_name = self.descr.archive_name.clone();
        let temp_descr = with_transaction(catalog, |catalog| {
            let mut temp = catalog.exists_by_name(&archive_name)?;
            if temp.id >= 0 {
                temp.coninfo.attrs.push(ConnectionAttr::ArchiveId);
                temp.coninfo.attrs.push(ConnectionAttr::Type);
                temp.coninfo.attrs.push(ConnectionAttr::Dsn);
                temp.coninfo.attrs.push(ConnectionAttr::PgHost);
                temp.coninfo.attrs.push(ConnectionAttr::PgPort);
                temp.coninfo.attrs.push(ConnectionAttr::PgUser);
                temp.coninfo.attrs.push(ConnectionAttr::PgDatabase);

                let archive_id = temp.id;
                catalog.get_catalog_connection_into(
                    &mut temp.coninfo,
                    archive_id,
                    ConnectionType::Basebackup,
                )?;
            }
            Ok(temp)
        })?;

        if temp_descr.id < 0 {
            return Err(CatalogError::archive(format!(
                "archive \"{archive_name}\" does not exist"
            ))
            .into());
        }

        // Resolve the backup profile; without an explicit PROFILE the
        // reserved default profile is used.
        let explicit = !self.descr.backup_profile.name.is_empty();
        let profile_name = if explicit {
            self.descr.backup_profile.name.clone()
        } else {
            "default".to_string()
        };

        let profile =
            with_transaction(catalog, |catalog| Ok(catalog.get_backup_profile(&profile_name)?))?;

        if profile.profile_id < 0 {
            let msg = if explicit {
                format!("backup profile \"{profile_name}\" does not exist")
            } else {
                "\"default\" profile not found: please check your backup catalog or create a new one"
                    .to_string()
            };
            return Err(CatalogError::archive(msg).into());
        }

        let mut stream = self
            .stream_override
            .take()
            .unwrap_or_else(|| Box::new(PgStream::new(&temp_descr)));
        let mut writer = StreamBackupWriter::new(&temp_descr.directory, profile.compress_type);

        let mut backup = BaseBackupDescr::new();
        let mut registered = false;

        let outcome = run_stream(
            catalog,
            stream.as_mut(),
            &mut writer,
            &profile,
            &temp_descr,
            &mut backup,
            &mut registered,
        )
        .await;

        if let Err(e) = outcome {
            // If the basebackup made it into the catalog, mark it
            // aborted in a fresh transaction. Compensation failures are
            // swallowed so the original error reaches the user.
            if registered {
                match catalog.start_transaction() {
                    Ok(()) => match catalog.abort_basebackup(&backup) {
                        Ok(()) => {
                            if catalog.commit().is_err() {
                                rollback_guard(catalog);
                            }
                        }
                        Err(abort_err) => {
                            rollback_guard(catalog);
                            debug!("marking basebackup as aborted failed: {abort_err}");
                        }
                    },
                    Err(tx_err) => debug!("could not start abort transaction: {tx_err}"),
                }
            }
            return Err(e);
        }

        // Everything went through, finalize the registration.
        with_transaction(catalog, |catalog| {
            catalog.finalize_basebackup(&mut backup)?;
            Ok(())
        })?;

        info!(
            "basebackup {} finalized, {} tablespace(s), {} .. {}",
            backup.id,
            backup.tablespaces.len(),
            backup.xlogpos,
            backup.xlogposend
        );
        Ok(())
    }
}

/// The streaming phase: connect, identify, begin the backup, register it,
/// iterate tablespaces into the writer, end the stream.
async fn run_stream(
    catalog: &mut BackupCatalog,
    stream: &mut dyn ReplicationStream,
    writer: &mut StreamBackupWriter,
    profile: &BackupProfileDescr,
    archive: &CatalogDescr,
    backup: &mut BaseBackupDescr,
    registered: &mut bool,
) -> Result<()> {
    stream.connect().await?;
    stream.identify().await?;

    *backup = stream.start_backup(profile).await?;

    // Allocate and create the target directory, then register the
    // basebackup. The directory handle is only passed to the tablespace
    // steps later, fsentry has to be recorded here.
    with_transaction(catalog, |catalog| {
        writer.initialize()?;
        writer.create()?;
        backup.archive_id = archive.id;
        backup.fsentry = writer.backup_directory_string();
        catalog.register_basebackup(archive.id, backup)?;
        Ok(())
    })?;
    *registered = true;

    stream.read_tablespace_info().await?;

    while let Some(mut spc) = stream.step_tablespace().await? {
        debug!("streaming tablespace OID {}, size {}", spc.spcoid, spc.spcsize);

        spc.backup_id = backup.id;
        catalog.register_tablespace_for_backup(&mut spc)?;

        writer.start_tablespace(&spc)?;
        while let Some(chunk) = stream.next_chunk().await? {
            writer.write_chunk(&chunk)?;
        }
        writer.finish_tablespace()?;
        backup.tablespaces.push(spc);
    }

    backup.xlogposend = stream.end_backup().await?;
    stream.disconnect().await?;
    Ok(())
}

pub struct ListBackupCatalogCommand {
    descr: CatalogDescr,
}

impl ListBackupCatalogCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for ListBackupCatalogCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::ListBackupCatalog
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &self.descr;
        with_transaction(catalog, |catalog| {
            let archive = resolve_archive(catalog, &descr.archive_name)?;

            let stat = catalog.stat_catalog(&descr.archive_name)?;
            print!("{stat}");

            let backups = catalog.get_backup_list(archive.id)?;
            print!(
                "{}",
                make_header(
                    &format!("Basebackups in archive \"{}\"", descr.archive_name),
                    &format!(
                        "{:<6}\t{:<19}\t{:<19}\t{:<12}\t{:<6}",
                        "ID", "Started", "Stopped", "Status", "Pinned"
                    ),
                    96
                )
            );
            for backup in &backups {
                println!(
                    "{:<6}\t{:<19}\t{:<19}\t{:<12}\t{:<6}",
                    backup.id, backup.started, backup.stopped, backup.status, backup.pinned
                );
            }
            Ok(())
        })
    }
}

pub struct PinCommand {
    descr: CatalogDescr,
    pin: PinDescr,
}

impl PinCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Result<Self> {
        let pin = descr
            .pin_descr()
            .cloned()
            .ok_or_else(|| BunkerError::from(CatalogError::catalog(
                "PIN/UNPIN command without an initialized pin descriptor",
            )))?;

        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Ok(Self { descr: own, pin })
    }
}

#[async_trait(?Send)]
impl CatalogCommand for PinCommand {
    fn tag(&self) -> CatalogTag {
        self.descr.tag
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &self.descr;
        let pin = &self.pin;
        with_transaction(catalog, |catalog| {
            let archive = resolve_archive(catalog, &descr.archive_name)?;
            let affected = catalog.perform_pin_action(archive.id, pin)?;
            println!("{affected} basebackup(s) affected");
            Ok(())
        })
    }
}
