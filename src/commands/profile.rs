//! Backup profile commands: create, drop, list.

use async_trait::async_trait;

use catalog::stat::make_header;
use catalog::{
    BackupCatalog, BackupProfileDescr, CatalogDescr, CatalogError, CatalogTag, ProfileAttr,
};

use super::{ensure_open, with_transaction, CatalogCommand};
use crate::error::Result;

pub struct CreateBackupProfileCommand {
    profile: BackupProfileDescr,
}

impl CreateBackupProfileCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        // copy_from() has no idea of submodule descriptors, the profile
        // is taken over explicitly.
        Self {
            profile: descr.backup_profile.clone(),
        }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for CreateBackupProfileCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::CreateBackupProfile
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, exists_ok: bool) -> Result<()> {
        ensure_open(catalog)?;

        let profile = &mut self.profile;
        with_transaction(catalog, |catalog| {
            let temp = catalog.get_backup_profile(&profile.name)?;

            if temp.profile_id < 0 {
                // The parser might not have seen every attribute if the
                // user kept defaults; pass down the full required set.
                profile.attrs.set(ProfileAttr::required_for_create());
                catalog.create_backup_profile(profile)?;
            } else if !exists_ok {
                return Err(CatalogError::catalog(format!(
                    "backup profile \"{}\" already exists",
                    profile.name
                ))
                .into());
            }
            Ok(())
        })
    }
}

pub struct DropBackupProfileCommand {
    profile: BackupProfileDescr,
}

impl DropBackupProfileCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        Self {
            profile: descr.backup_profile.clone(),
        }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for DropBackupProfileCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::DropBackupProfile
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _extended: bool) -> Result<()> {
        ensure_open(catalog)?;

        let name = self.profile.name.clone();
        with_transaction(catalog, |catalog| {
            let temp = catalog.get_backup_profile(&name)?;
            if temp.profile_id < 0 {
                return Err(CatalogError::catalog(format!(
                    "backup profile \"{name}\" does not exist"
                ))
                .into());
            }
            catalog.drop_backup_profile(&name)?;
            Ok(())
        })
    }
}

pub struct ListBackupProfileCommand {
    tag: CatalogTag,
    profile: BackupProfileDescr,
}

impl ListBackupProfileCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        Self {
            tag: descr.tag,
            profile: descr.backup_profile.clone(),
        }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for ListBackupProfileCommand {
    fn tag(&self) -> CatalogTag {
        self.tag
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _extended: bool) -> Result<()> {
        ensure_open(catalog)?;

        let tag = self.tag;
        let name = self.profile.name.clone();
        with_transaction(catalog, |catalog| {
            if tag == CatalogTag::ListBackupProfile {
                let profiles = catalog.get_backup_profiles()?;
                print!(
                    "{}",
                    make_header(
                        "List of backup profiles",
                        &format!("{:<25}\t{:<15}", "Name", "Backup Label"),
                        80
                    )
                );
                for profile in &profiles {
                    println!("{:<25}\t{:<15}", profile.name, profile.label);
                }
            } else {
                let profile = catalog.get_backup_profile(&name)?;
                if profile.profile_id < 0 {
                    return Err(CatalogError::catalog(format!(
                        "backup profile \"{name}\" does not exist"
                    ))
                    .into());
                }

                print!(
                    "{}",
                    make_header(
                        &format!("Details for backup profile {}", profile.name),
                        &format!("{:<25}\t{:<40}", "Property", "Setting"),
                        80
                    )
                );
                println!("{:<25}\t{:<30}", "NAME", profile.name);
                println!(
                    "{:<25}\t{:<30}",
                    "COMPRESSION",
                    profile.compress_type.as_str().to_uppercase()
                );
                if profile.max_rate == 0 {
                    println!("{:<25}\t{:<30}", "MAX RATE", "NOT RATED");
                } else {
                    println!("{:<25}\t{:<30}", "MAX RATE(kbps)", profile.max_rate);
                }
                println!("{:<25}\t{:<30}", "LABEL", profile.label);
                println!("{:<25}\t{:<30}", "FAST CHECKPOINT", profile.fast_checkpoint);
                println!("{:<25}\t{:<30}", "WAL INCLUDED", profile.include_wal);
                println!("{:<25}\t{:<30}", "WAIT FOR WAL", profile.wait_for_wal);
            }
            Ok(())
        })
    }
}
