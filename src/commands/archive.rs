//! Archive commands: create, alter, drop, verify, list.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use log::info;

use catalog::stat::{make_header, make_line};
use catalog::{
    ArchiveAttr, BackupCatalog, CatalogDescr, CatalogError, CatalogTag, ConnectionType,
};
use stream::writer::BACKUP_MAGIC_FILE;

use super::{ensure_open, resolve_archive, with_transaction, CatalogCommand};
use crate::error::Result;

pub struct CreateArchiveCommand {
    descr: CatalogDescr,
}

impl CreateArchiveCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for CreateArchiveCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::CreateArchive
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, exists_ok: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &mut self.descr;
        with_transaction(catalog, |catalog| {
            let temp = catalog.exists(&descr.directory)?;

            if temp.id < 0 {
                // New archive entry; every archive gets its basebackup
                // connection at creation time.
                catalog.create_archive(descr)?;
                descr.coninfo.contype = ConnectionType::Basebackup;
                catalog.create_catalog_connection(&descr.coninfo)?;
                info!("archive \"{}\" created", descr.archive_name);
            } else {
                if !exists_ok {
                    return Err(CatalogError::archive(format!(
                        "archive already exists: \"{}\"",
                        descr.directory
                    ))
                    .into());
                }
                // Update the existing entry's affected attributes.
                descr.id = temp.id;
                catalog.update_archive_attributes(descr, &descr.attrs.clone())?;
            }
            Ok(())
        })
    }
}

pub struct AlterArchiveCommand {
    descr: CatalogDescr,
}

impl AlterArchiveCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for AlterArchiveCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::AlterArchive
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, ignore_missing: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &mut self.descr;
        with_transaction(catalog, |catalog| {
            let temp = catalog.exists_by_name(&descr.archive_name)?;

            if temp.id >= 0 {
                descr.id = temp.id;
                catalog.update_archive_attributes(descr, &descr.attrs.clone())?;
            } else if !ignore_missing {
                return Err(CatalogError::archive(format!(
                    "could not alter archive: archive \"{}\" does not exist",
                    descr.archive_name
                ))
                .into());
            }
            Ok(())
        })
    }
}

pub struct DropArchiveCommand {
    descr: CatalogDescr,
}

impl DropArchiveCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for DropArchiveCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::DropArchive
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, exists_ok: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &self.descr;
        with_transaction(catalog, |catalog| {
            let temp = catalog.exists_by_name(&descr.archive_name)?;

            if temp.id >= 0 {
                catalog.drop_archive(&descr.archive_name)?;
                info!("archive \"{}\" dropped", descr.archive_name);
            } else if !exists_ok {
                return Err(CatalogError::archive(format!(
                    "archive \"{}\" does not exist",
                    descr.archive_name
                ))
                .into());
            }
            Ok(())
        })
    }
}

pub struct VerifyArchiveCommand {
    descr: CatalogDescr,
}

impl VerifyArchiveCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for VerifyArchiveCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::VerifyArchive
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _missing_ok: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &self.descr;
        with_transaction(catalog, |catalog| {
            let temp = resolve_archive(catalog, &descr.archive_name)?;
            verify_archive_directory(Path::new(&temp.directory))?;
            println!("archive \"{}\" verified OK", descr.archive_name);
            Ok(())
        })
    }
}

/// Filesystem integrity check for an archive directory: the root must be
/// a directory and every backup subdirectory must carry the magic marker.
pub fn verify_archive_directory(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(CatalogError::archive(format!(
            "archive directory \"{}\" does not exist",
            root.display()
        ))
        .into());
    }

    for entry in fs::read_dir(root).map_err(CatalogError::Io)? {
        let entry = entry.map_err(CatalogError::Io)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("basebackup-") {
            continue;
        }
        if !path.join(BACKUP_MAGIC_FILE).is_file() {
            return Err(CatalogError::archive(format!(
                "backup directory \"{}\" is missing its {} marker",
                path.display(),
                BACKUP_MAGIC_FILE
            ))
            .into());
        }
    }
    Ok(())
}

/// Output modes for the archive listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListArchiveMode {
    List,
    Filtered,
    Detail,
}

pub struct ListArchiveCommand {
    descr: CatalogDescr,
}

impl ListArchiveCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }

    fn mode(&self) -> ListArchiveMode {
        if !self.descr.archive_name.is_empty() {
            ListArchiveMode::Detail
        } else if !self.descr.attrs.is_empty() {
            ListArchiveMode::Filtered
        } else {
            ListArchiveMode::List
        }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for ListArchiveCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::ListArchive
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _extended: bool) -> Result<()> {
        ensure_open(catalog)?;

        let mode = self.mode();
        let descr = &mut self.descr;
        with_transaction(catalog, |catalog| {
            match mode {
                ListArchiveMode::List => {
                    let archives = catalog.get_archive_list()?;
                    print!(
                        "{}",
                        make_header(
                            "List of archives",
                            &format!("{:<15}\t{:<30}", "Name", "Directory"),
                            80
                        )
                    );
                    for archive in &archives {
                        println!("{:<15}\t{:<30}", archive.archive_name, archive.directory);
                    }
                }
                ListArchiveMode::Filtered => {
                    let archives =
                        catalog.get_archive_list_filtered(descr, &descr.attrs.clone())?;
                    print!(
                        "{}",
                        make_header(
                            "Filtered archive list",
                            &format!("{:<15}\t{:<30}", "Name", "Directory"),
                            80
                        )
                    );
                    for archive in &archives {
                        println!("{:<15}\t{:<30}", archive.archive_name, archive.directory);
                    }
                }
                ListArchiveMode::Detail => {
                    descr.attrs.push(ArchiveAttr::Name);
                    let archives =
                        catalog.get_archive_list_filtered(descr, &descr.attrs.clone())?;
                    print!(
                        "{}",
                        make_header(
                            "Detail view for archive",
                            &format!("{:<20}\t{:<30}", "Property", "Setting"),
                            80
                        )
                    );
                    for archive in &archives {
                        println!("{:<20}\t{:<30}", "NAME", archive.archive_name);
                        println!("{:<20}\t{:<30}", "DIRECTORY", archive.directory);
                        println!("{:<20}\t{:<30}", "PGHOST", archive.coninfo.pghost);
                        println!("{:<20}\t{:<30}", "PGPORT", archive.coninfo.pgport);
                        println!("{:<20}\t{:<30}", "PGDATABASE", archive.coninfo.pgdatabase);
                        println!("{:<20}\t{:<30}", "PGUSER", archive.coninfo.pguser);
                        println!("{:<20}\t{:<30}", "DSN", archive.coninfo.dsn);
                        println!("{:<20}\t{:<30}", "COMPRESSION", archive.compression);
                        println!("{}", make_line(80));
                    }
                }
            }
            Ok(())
        })
    }
}
