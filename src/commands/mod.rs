//! The command layer.
//!
//! One command object per user action. Every command implements
//! `execute(catalog, flag)` with the shared envelope: assert the catalog,
//! open it read-write if necessary, start a transaction, perform lookups
//! and mutations, commit on success and roll back re-raising unchanged on
//! any domain failure. `flag` is command-specific (existsOk,
//! ignoreMissing, background, extended, missingOk).

pub mod archive;
pub mod basebackup;
pub mod connection;
pub mod profile;
pub mod retention;
pub mod worker;

use async_trait::async_trait;
use log::warn;

use catalog::{BackupCatalog, CatalogDescr, CatalogError, CatalogTag};

use crate::error::Result;

#[async_trait(?Send)]
pub trait CatalogCommand: Send {
    fn tag(&self) -> CatalogTag;

    async fn execute(&mut self, catalog: &mut BackupCatalog, flag: bool) -> Result<()>;
}

/// Selects the command for a populated catalog descriptor.
pub fn command_for(descr: &CatalogDescr) -> Result<Box<dyn CatalogCommand>> {
    let command: Box<dyn CatalogCommand> = match descr.tag {
        CatalogTag::CreateArchive => Box::new(archive::CreateArchiveCommand::from_descr(descr)),
        CatalogTag::AlterArchive => Box::new(archive::AlterArchiveCommand::from_descr(descr)),
        CatalogTag::DropArchive => Box::new(archive::DropArchiveCommand::from_descr(descr)),
        CatalogTag::VerifyArchive => Box::new(archive::VerifyArchiveCommand::from_descr(descr)),
        CatalogTag::ListArchive => Box::new(archive::ListArchiveCommand::from_descr(descr)),

        CatalogTag::CreateConnection => {
            Box::new(connection::CreateConnectionCommand::from_descr(descr))
        }
        CatalogTag::DropConnection => {
            Box::new(connection::DropConnectionCommand::from_descr(descr))
        }
        CatalogTag::ListConnection => {
            Box::new(connection::ListConnectionCommand::from_descr(descr))
        }

        CatalogTag::CreateBackupProfile => {
            Box::new(profile::CreateBackupProfileCommand::from_descr(descr))
        }
        CatalogTag::DropBackupProfile => {
            Box::new(profile::DropBackupProfileCommand::from_descr(descr))
        }
        CatalogTag::ListBackupProfile | CatalogTag::ListBackupProfileDetail => {
            Box::new(profile::ListBackupProfileCommand::from_descr(descr))
        }

        CatalogTag::StartBasebackup => {
            Box::new(basebackup::StartBasebackupCommand::from_descr(descr))
        }
        CatalogTag::ListBackupCatalog => {
            Box::new(basebackup::ListBackupCatalogCommand::from_descr(descr))
        }
        CatalogTag::PinBasebackup | CatalogTag::UnpinBasebackup => {
            Box::new(basebackup::PinCommand::from_descr(descr)?)
        }

        CatalogTag::StartLauncher => Box::new(worker::StartLauncherCommand::from_descr(descr)),

        CatalogTag::CreateRetentionPolicy => {
            Box::new(retention::CreateRetentionPolicyCommand::from_descr(descr)?)
        }
        CatalogTag::DropRetentionPolicy => {
            Box::new(retention::DropRetentionPolicyCommand::from_descr(descr))
        }
        CatalogTag::ListRetentionPolicies | CatalogTag::ListRetentionPolicy => {
            Box::new(retention::ListRetentionPoliciesCommand::from_descr(descr))
        }
        CatalogTag::ApplyRetentionPolicy => {
            Box::new(retention::ApplyRetentionPolicyCommand::from_descr(descr))
        }

        other => {
            return Err(CatalogError::catalog(format!(
                "no command registered for {}",
                other.name()
            ))
            .into())
        }
    };
    Ok(command)
}

/// Opens the catalog read-write if it is not available yet.
pub(crate) fn ensure_open(catalog: &mut BackupCatalog) -> Result<()> {
    if !catalog.available() {
        catalog.open_rw()?;
    }
    Ok(())
}

/// Rolls back the active transaction, keeping the original error alive.
pub(crate) fn rollback_guard(catalog: &mut BackupCatalog) {
    if let Err(e) = catalog.rollback() {
        warn!("rollback failed: {e}");
    }
}

/// Resolves an archive by name, erroring with the user key if absent.
pub(crate) fn resolve_archive(
    catalog: &BackupCatalog,
    archive_name: &str,
) -> Result<CatalogDescr> {
    let descr = catalog.exists_by_name(archive_name)?;
    if descr.id < 0 {
        return Err(
            CatalogError::archive(format!("archive \"{archive_name}\" does not exist")).into(),
        );
    }
    Ok(descr)
}

/// Runs `body` inside the command's catalog transaction, committing on
/// success and rolling back re-raising unchanged on failure.
pub(crate) fn with_transaction<T>(
    catalog: &mut BackupCatalog,
    body: impl FnOnce(&mut BackupCatalog) -> Result<T>,
) -> Result<T> {
    catalog.start_transaction()?;
    match body(catalog) {
        Ok(value) => {
            catalog.commit()?;
            Ok(value)
        }
        Err(e) => {
            rollback_guard(catalog);
            Err(e)
        }
    }
}
