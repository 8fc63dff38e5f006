use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::debug;

use catalog::{
    ArchiveAttr, BackupCatalog, BackupCompressType, CatalogDescr, CatalogTag, ConnectionType,
    PinOperation,
};
use pgbunker::commands;
use pgbunker::commands::retention::parse_retention_rule;
use pgbunker::vars::VariableEnvironment;

#[derive(Parser, Debug)]
#[clap(name = "pgbunker", about = "Backup and archiving engine for PostgreSQL", version)]
struct Cli {
    /// Path to the backup catalog database
    #[clap(long, global = true, env = "PGBUNKER_CATALOG", default_value = "pgbunker.db")]
    catalog: PathBuf,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage backup archives
    #[clap(subcommand)]
    Archive(ArchiveCommands),

    /// Manage catalog database connections
    #[clap(subcommand)]
    Connection(ConnectionCommands),

    /// Manage backup profiles
    #[clap(subcommand)]
    Profile(ProfileCommands),

    /// Run and inspect basebackups
    #[clap(subcommand)]
    Basebackup(BasebackupCommands),

    /// Control the background worker launcher
    #[clap(subcommand)]
    Launcher(LauncherCommands),

    /// Manage retention policies
    #[clap(subcommand)]
    Retention(RetentionCommands),

    /// Show, set or reset runtime variables
    #[clap(subcommand)]
    Var(VarCommands),
}

#[derive(Subcommand, Debug)]
enum ArchiveCommands {
    /// Register a new archive and its basebackup connection
    Create {
        /// Archive name
        name: String,

        /// Absolute archive directory
        #[clap(long)]
        directory: String,

        /// PostgreSQL host
        #[clap(long, default_value = "localhost")]
        pghost: String,

        /// PostgreSQL port
        #[clap(long, default_value = "5432")]
        pgport: i64,

        /// PostgreSQL user
        #[clap(long, default_value = "postgres")]
        pguser: String,

        /// PostgreSQL database
        #[clap(long, default_value = "postgres")]
        pgdatabase: String,

        /// Full connection DSN, overrides the individual settings
        #[clap(long)]
        dsn: Option<String>,

        /// Store WAL segments compressed
        #[clap(long)]
        compression: bool,

        /// Update the existing archive instead of failing
        #[clap(long)]
        exists_ok: bool,
    },

    /// Alter attributes of an existing archive
    Alter {
        /// Archive name
        name: String,

        /// Toggle WAL segment compression
        #[clap(long)]
        compression: Option<bool>,

        /// Succeed even if the archive does not exist
        #[clap(long)]
        ignore_missing: bool,
    },

    /// Drop an archive, cascading connections and basebackups
    Drop {
        /// Archive name
        name: String,

        /// Succeed even if the archive does not exist
        #[clap(long)]
        if_exists: bool,
    },

    /// Check the archive directory structure
    Verify {
        /// Archive name
        name: String,
    },

    /// List archives, or one archive in detail
    List {
        /// Archive name for the detail view
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConnectionCommands {
    /// Attach a connection of the given type to an archive
    Create {
        /// Archive name
        #[clap(long)]
        archive: String,

        /// Connection type (basebackup, streamer)
        #[clap(long = "type")]
        contype: String,

        /// Full connection DSN
        #[clap(long)]
        dsn: Option<String>,

        /// PostgreSQL host
        #[clap(long, default_value = "localhost")]
        pghost: String,

        /// PostgreSQL port
        #[clap(long, default_value = "5432")]
        pgport: i64,

        /// PostgreSQL user
        #[clap(long, default_value = "postgres")]
        pguser: String,

        /// PostgreSQL database
        #[clap(long, default_value = "postgres")]
        pgdatabase: String,
    },

    /// Drop the connection of the given type
    Drop {
        /// Archive name
        #[clap(long)]
        archive: String,

        /// Connection type (basebackup, streamer)
        #[clap(long = "type")]
        contype: String,
    },

    /// List the connections of an archive
    List {
        /// Archive name
        #[clap(long)]
        archive: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileCommands {
    /// Create a backup profile
    Create {
        /// Profile name
        name: String,

        /// Compression type (none, gzip, zstd, pbzip, plain)
        #[clap(long, default_value = "none")]
        compression: String,

        /// Transfer cap in kbps, 0 means unlimited
        #[clap(long, default_value = "0")]
        max_rate: u32,

        /// Backup label
        #[clap(long)]
        label: Option<String>,

        /// Request a fast checkpoint
        #[clap(long)]
        fast_checkpoint: bool,

        /// Include WAL segments in the backup
        #[clap(long)]
        include_wal: bool,

        /// Do not wait for WAL to be archived
        #[clap(long)]
        no_wait_for_wal: bool,

        /// Skip page checksum verification
        #[clap(long)]
        noverify_checksums: bool,

        /// Keep the existing profile instead of failing
        #[clap(long)]
        exists_ok: bool,
    },

    /// Drop a backup profile
    Drop {
        /// Profile name
        name: String,
    },

    /// List backup profiles, or one profile in detail
    List {
        /// Profile name for the detail view
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BasebackupCommands {
    /// Stream a new basebackup into an archive
    Start {
        /// Archive name
        #[clap(long)]
        archive: String,

        /// Backup profile, defaults to the "default" profile
        #[clap(long)]
        profile: Option<String>,

        /// Advisory hint for the worker launcher
        #[clap(long)]
        background: bool,
    },

    /// Show the backup catalog of an archive
    List {
        /// Archive name
        #[clap(long)]
        archive: String,
    },

    /// Pin basebackups against retention eviction
    Pin {
        /// Archive name
        #[clap(long)]
        archive: String,

        /// Pin the basebackup with this id
        #[clap(long)]
        id: Option<i64>,

        /// Pin this many basebackups, oldest first
        #[clap(long)]
        count: Option<u32>,

        /// Pin the newest basebackup
        #[clap(long)]
        newest: bool,

        /// Pin the oldest basebackup
        #[clap(long)]
        oldest: bool,
    },

    /// Unpin basebackups
    Unpin {
        /// Archive name
        #[clap(long)]
        archive: String,

        /// Unpin the basebackup with this id
        #[clap(long)]
        id: Option<i64>,

        /// Unpin this many basebackups, oldest first
        #[clap(long)]
        count: Option<u32>,

        /// Unpin the newest basebackup
        #[clap(long)]
        newest: bool,

        /// Unpin the oldest basebackup
        #[clap(long)]
        oldest: bool,

        /// Unpin every currently pinned basebackup
        #[clap(long)]
        pinned: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LauncherCommands {
    /// Fork the background worker launcher
    Start {
        /// Keep the launcher attached to the terminal
        #[clap(long)]
        no_detach: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RetentionCommands {
    /// Create a retention policy from one or more rules
    Create {
        /// Policy name
        name: String,

        /// Rule expression, repeatable (e.g. "KEEP 4", "DROP OLDER 30 days")
        #[clap(long = "rule", required = true)]
        rules: Vec<String>,
    },

    /// Drop a retention policy
    Drop {
        /// Policy name
        name: String,

        /// Succeed even if the policy does not exist
        #[clap(long)]
        if_exists: bool,
    },

    /// List retention policies, or one policy in detail
    List {
        /// Policy name for the detail view
        name: Option<String>,
    },

    /// Compute the cleanup for an archive under a policy
    Apply {
        /// Archive name
        #[clap(long)]
        archive: String,

        /// Policy name
        #[clap(long)]
        policy: String,
    },
}

#[derive(Subcommand, Debug)]
enum VarCommands {
    /// Show one variable, or all of them
    Show { name: Option<String> },

    /// Set a variable
    Set { name: String, value: String },

    /// Reset a variable to its default
    Reset { name: String },
}

fn pin_operation(
    id: Option<i64>,
    count: Option<u32>,
    newest: bool,
    oldest: bool,
    pinned: bool,
) -> Result<PinOperation> {
    let mut ops = Vec::new();
    if let Some(id) = id {
        ops.push(PinOperation::Id(id));
    }
    if let Some(count) = count {
        ops.push(PinOperation::Count(count));
    }
    if newest {
        ops.push(PinOperation::Newest);
    }
    if oldest {
        ops.push(PinOperation::Oldest);
    }
    if pinned {
        ops.push(PinOperation::Pinned);
    }

    match ops.len() {
        1 => Ok(ops.remove(0)),
        0 => anyhow::bail!("one of --id, --count, --newest, --oldest is required"),
        _ => anyhow::bail!("pin actions are mutually exclusive"),
    }
}

/// Builds the catalog descriptor and the command-specific flag for one
/// parsed invocation.
fn descriptor_for(command: &Commands) -> Result<(CatalogDescr, bool)> {
    let (descr, flag) = match command {
        Commands::Archive(cmd) => match cmd {
            ArchiveCommands::Create {
                name,
                directory,
                pghost,
                pgport,
                pguser,
                pgdatabase,
                dsn,
                compression,
                exists_ok,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::CreateArchive);
                descr.archive_name = name.clone();
                descr.directory = directory.clone();
                descr.compression = *compression;
                descr.attrs.push(ArchiveAttr::Name);
                descr.attrs.push(ArchiveAttr::Compression);
                descr.coninfo.pghost = pghost.clone();
                descr.coninfo.pgport = *pgport;
                descr.coninfo.pguser = pguser.clone();
                descr.coninfo.pgdatabase = pgdatabase.clone();
                descr.coninfo.dsn = dsn.clone().unwrap_or_default();
                descr.coninfo.contype = ConnectionType::Basebackup;
                (descr, *exists_ok)
            }
            ArchiveCommands::Alter {
                name,
                compression,
                ignore_missing,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::AlterArchive);
                descr.archive_name = name.clone();
                if let Some(compression) = compression {
                    descr.compression = *compression;
                    descr.attrs.push(ArchiveAttr::Compression);
                }
                (descr, *ignore_missing)
            }
            ArchiveCommands::Drop { name, if_exists } => {
                let mut descr = CatalogDescr::new(CatalogTag::DropArchive);
                descr.archive_name = name.clone();
                (descr, *if_exists)
            }
            ArchiveCommands::Verify { name } => {
                let mut descr = CatalogDescr::new(CatalogTag::VerifyArchive);
                descr.archive_name = name.clone();
                (descr, false)
            }
            ArchiveCommands::List { name } => {
                let mut descr = CatalogDescr::new(CatalogTag::ListArchive);
                if let Some(name) = name {
                    descr.archive_name = name.clone();
                }
                (descr, false)
            }
        },

        Commands::Connection(cmd) => match cmd {
            ConnectionCommands::Create {
                archive,
                contype,
                dsn,
                pghost,
                pgport,
                pguser,
                pgdatabase,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::CreateConnection);
                descr.archive_name = archive.clone();
                descr.coninfo.contype = ConnectionType::parse(contype)?;
                descr.coninfo.dsn = dsn.clone().unwrap_or_default();
                descr.coninfo.pghost = pghost.clone();
                descr.coninfo.pgport = *pgport;
                descr.coninfo.pguser = pguser.clone();
                descr.coninfo.pgdatabase = pgdatabase.clone();
                (descr, false)
            }
            ConnectionCommands::Drop { archive, contype } => {
                let mut descr = CatalogDescr::new(CatalogTag::DropConnection);
                descr.archive_name = archive.clone();
                descr.coninfo.contype = ConnectionType::parse(contype)?;
                (descr, false)
            }
            ConnectionCommands::List { archive } => {
                let mut descr = CatalogDescr::new(CatalogTag::ListConnection);
                descr.archive_name = archive.clone();
                (descr, false)
            }
        },

        Commands::Profile(cmd) => match cmd {
            ProfileCommands::Create {
                name,
                compression,
                max_rate,
                label,
                fast_checkpoint,
                include_wal,
                no_wait_for_wal,
                noverify_checksums,
                exists_ok,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::CreateBackupProfile);
                descr.backup_profile.name = name.clone();
                descr.backup_profile.compress_type = BackupCompressType::parse(compression)?;
                descr.backup_profile.max_rate = *max_rate;
                if let Some(label) = label {
                    descr.backup_profile.label = label.clone();
                }
                descr.backup_profile.fast_checkpoint = *fast_checkpoint;
                descr.backup_profile.include_wal = *include_wal;
                descr.backup_profile.wait_for_wal = !no_wait_for_wal;
                descr.backup_profile.noverify_checksums = *noverify_checksums;
                (descr, *exists_ok)
            }
            ProfileCommands::Drop { name } => {
                let mut descr = CatalogDescr::new(CatalogTag::DropBackupProfile);
                descr.backup_profile.name = name.clone();
                (descr, false)
            }
            ProfileCommands::List { name } => {
                let tag = if name.is_some() {
                    CatalogTag::ListBackupProfileDetail
                } else {
                    CatalogTag::ListBackupProfile
                };
                let mut descr = CatalogDescr::new(tag);
                if let Some(name) = name {
                    descr.backup_profile.name = name.clone();
                }
                (descr, false)
            }
        },

        Commands::Basebackup(cmd) => match cmd {
            BasebackupCommands::Start {
                archive,
                profile,
                background,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::StartBasebackup);
                descr.archive_name = archive.clone();
                if let Some(profile) = profile {
                    descr.backup_profile.name = profile.clone();
                }
                (descr, *background)
            }
            BasebackupCommands::List { archive } => {
                let mut descr = CatalogDescr::new(CatalogTag::ListBackupCatalog);
                descr.archive_name = archive.clone();
                (descr, false)
            }
            BasebackupCommands::Pin {
                archive,
                id,
                count,
                newest,
                oldest,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::PinBasebackup);
                descr.archive_name = archive.clone();
                let operation = pin_operation(*id, *count, *newest, *oldest, false)?;
                descr.make_pin_descr(operation)?;
                (descr, false)
            }
            BasebackupCommands::Unpin {
                archive,
                id,
                count,
                newest,
                oldest,
                pinned,
            } => {
                let mut descr = CatalogDescr::new(CatalogTag::UnpinBasebackup);
                descr.archive_name = archive.clone();
                let operation = pin_operation(*id, *count, *newest, *oldest, *pinned)?;
                descr.make_pin_descr(operation)?;
                (descr, false)
            }
        },

        Commands::Launcher(cmd) => match cmd {
            LauncherCommands::Start { no_detach } => {
                let mut descr = CatalogDescr::new(CatalogTag::StartLauncher);
                descr.detach = !no_detach;
                (descr, false)
            }
        },

        Commands::Retention(cmd) => match cmd {
            RetentionCommands::Create { name, rules } => {
                let mut descr = CatalogDescr::new(CatalogTag::CreateRetentionPolicy);
                descr.retention_name = name.clone();
                descr.make_retention_descr();
                for rule in rules {
                    let parsed = parse_retention_rule(rule)?;
                    descr.make_retention_rule(parsed.rule_type, parsed.value);
                }
                (descr, false)
            }
            RetentionCommands::Drop { name, if_exists } => {
                let mut descr = CatalogDescr::new(CatalogTag::DropRetentionPolicy);
                descr.retention_name = name.clone();
                (descr, *if_exists)
            }
            RetentionCommands::List { name } => {
                let tag = if name.is_some() {
                    CatalogTag::ListRetentionPolicy
                } else {
                    CatalogTag::ListRetentionPolicies
                };
                let mut descr = CatalogDescr::new(tag);
                if let Some(name) = name {
                    descr.retention_name = name.clone();
                }
                (descr, false)
            }
            RetentionCommands::Apply { archive, policy } => {
                let mut descr = CatalogDescr::new(CatalogTag::ApplyRetentionPolicy);
                descr.archive_name = archive.clone();
                descr.retention_name = policy.clone();
                (descr, false)
            }
        },

        Commands::Var(_) => unreachable!("variable commands are handled in main"),
    };
    Ok((descr, flag))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_level(true)
        .format_module_path(false)
        .format_indent(Some(4))
        .filter_level(log::LevelFilter::Info)
        .try_init()?;

    let cli = Cli::parse();

    // Variable commands only touch the runtime environment, the catalog
    // descriptor just carries the command tag.
    if let Commands::Var(cmd) = &cli.command {
        let descr = CatalogDescr::new(match cmd {
            VarCommands::Show { name: Some(_) } => CatalogTag::ShowVariable,
            VarCommands::Show { name: None } => CatalogTag::ShowVariables,
            VarCommands::Set { .. } => CatalogTag::SetVariable,
            VarCommands::Reset { .. } => CatalogTag::ResetVariable,
        });
        debug!("executing {}", descr.tag.name());

        let mut env = VariableEnvironment::new();
        match cmd {
            VarCommands::Show { name } => env.show(name.as_deref())?,
            VarCommands::Set { name, value } => {
                env.set(name, value)?;
                env.show(Some(name))?;
            }
            VarCommands::Reset { name } => {
                env.reset(name)?;
                env.show(Some(name))?;
            }
        }
        return Ok(());
    }

    let (descr, flag) = descriptor_for(&cli.command)?;

    let mut catalog = BackupCatalog::new(&cli.catalog);
    let mut command = commands::command_for(&descr)?;
    command.execute(&mut catalog, flag).await?;

    Ok(())
}
