//! The launcher command and the background worker command handle.

use async_trait::async_trait;
use log::info;

use catalog::{BackupCatalog, CatalogDescr, CatalogTag};

use super::CatalogCommand;
use crate::error::Result;
use crate::launcher::{launch, JobInfo};

pub struct StartLauncherCommand {
    descr: CatalogDescr,
}

impl StartLauncherCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for StartLauncherCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::StartLauncher
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        let job = JobInfo {
            // Detach from the interactive terminal, if requested
            // (default).
            detach: self.descr.detach,
            // Keep stdio open so the worker does not clobber the
            // terminal with reopened descriptors.
            close_std_fd: false,
            catalog_path: catalog.path().to_path_buf(),
            cmd_handle: Box::new(BackgroundWorkerCommandHandle::new()),
        };

        let pid = launch(job)?;
        println!("background launcher launched at pid {pid}");
        Ok(())
    }
}

/// The command dispatched inside a launched worker. Its only coupling to
/// the catalog is the independent handle the worker opens from the
/// catalog path; everything else happens inside the worker process.
pub struct BackgroundWorkerCommandHandle;

impl BackgroundWorkerCommandHandle {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BackgroundWorkerCommandHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl CatalogCommand for BackgroundWorkerCommandHandle {
    fn tag(&self) -> CatalogTag {
        CatalogTag::BackgroundWorkerCommand
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _noop: bool) -> Result<()> {
        catalog.open_rw()?;
        info!(
            "background worker ready, catalog {}",
            catalog.path().display()
        );
        Ok(())
    }
}
