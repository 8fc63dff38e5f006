//! Connection commands: create, drop, list.

use async_trait::async_trait;

use catalog::stat::make_header;
use catalog::{BackupCatalog, CatalogDescr, CatalogError, CatalogTag, ConnectionDescr};

use super::{ensure_open, resolve_archive, with_transaction, CatalogCommand};
use crate::error::Result;

pub struct CreateConnectionCommand {
    descr: CatalogDescr,
}

impl CreateConnectionCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for CreateConnectionCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::CreateConnection
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &mut self.descr;
        with_transaction(catalog, |catalog| {
            let archive = resolve_archive(catalog, &descr.archive_name)?;
            descr.coninfo.archive_id = archive.id;

            // Reject a colliding connection type for this archive.
            let mut temp = ConnectionDescr::new();
            catalog.get_catalog_connection_into(&mut temp, archive.id, descr.coninfo.contype)?;
            if temp.archive_id >= 0 {
                return Err(CatalogError::catalog(format!(
                    "archive \"{}\" already has a connection of type \"{}\"",
                    descr.archive_name, descr.coninfo.contype
                ))
                .into());
            }

            catalog.create_catalog_connection(&descr.coninfo)?;
            Ok(())
        })
    }
}

pub struct DropConnectionCommand {
    descr: CatalogDescr,
}

impl DropConnectionCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for DropConnectionCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::DropConnection
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &mut self.descr;
        with_transaction(catalog, |catalog| {
            let archive = resolve_archive(catalog, &descr.archive_name)?;
            let contype = descr.coninfo.contype;

            let mut temp = ConnectionDescr::new();
            catalog.get_catalog_connection_into(&mut temp, archive.id, contype)?;
            if temp.archive_id < 0 {
                return Err(CatalogError::catalog(format!(
                    "archive \"{}\" does not have a connection of type \"{}\"",
                    descr.archive_name, contype
                ))
                .into());
            }

            catalog.drop_catalog_connection(&descr.archive_name, contype)?;
            Ok(())
        })
    }
}

pub struct ListConnectionCommand {
    descr: CatalogDescr,
}

impl ListConnectionCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for ListConnectionCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::ListConnection
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let descr = &self.descr;
        with_transaction(catalog, |catalog| {
            let archive = resolve_archive(catalog, &descr.archive_name)?;
            let connections = catalog.get_catalog_connections(archive.id)?;

            println!(
                "List of connections for archive \"{}\"",
                descr.archive_name
            );
            for con in &connections {
                print!(
                    "{}",
                    make_header(
                        &format!("connection type {}", con.contype),
                        &format!("{:<15}\t{:<60}", "Attribute", "Setting"),
                        80
                    )
                );
                println!("{:<15}\t{:<60}", "DSN", con.dsn);
                println!("{:<15}\t{:<60}", "PGHOST", con.pghost);
                println!("{:<15}\t{:<60}", "PGDATABASE", con.pgdatabase);
                println!("{:<15}\t{:<60}", "PGUSER", con.pguser);
                println!("{:<15}\t{:<60}", "PGPORT", con.pgport);
            }
            Ok(())
        })
    }
}
