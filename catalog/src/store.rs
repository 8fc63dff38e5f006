//! The transactional backup catalog over embedded SQLite.
//!
//! The catalog opens lazily; `open_rw()` creates the schema if absent and
//! every subsequent operation requires `available()`. Exactly one
//! transaction frames each logical operation; the store never rolls back
//! implicitly, failures surface to the caller who owns the rollback.
//!
//! Lookups return descriptors with a negative id instead of an absence
//! value so callers keep a typed handle for subsequent fills.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::descr::{
    ArchiveAttr, AttributeSet, BackupCompressType, BackupProfileDescr, BackupStatus,
    BackupTablespaceDescr, BaseBackupDescr, CatalogDescr, CatalogTag, ConnectionDescr,
    ConnectionType, PinDescr, PinOperation, ProfileAttr, RetentionDescr, RetentionRuleDescr,
};
use crate::error::{CatalogError, Result};
use crate::retention::{self, BackupCleanupDescr, RetentionIntervalDescr, RetentionRuleId};
use crate::stat::StatCatalogArchive;

/// Catalog schema, applied on every open (idempotent).
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS archive (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    directory   TEXT NOT NULL UNIQUE,
    compression INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS connections (
    archive_id INTEGER NOT NULL REFERENCES archive(id) ON DELETE CASCADE,
    type       TEXT NOT NULL,
    dsn        TEXT NOT NULL DEFAULT '',
    pghost     TEXT NOT NULL DEFAULT '',
    pgport     INTEGER NOT NULL DEFAULT -1,
    pguser     TEXT NOT NULL DEFAULT '',
    pgdatabase TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (archive_id, type)
);

CREATE TABLE IF NOT EXISTS backup_profiles (
    id                 INTEGER PRIMARY KEY,
    name               TEXT NOT NULL UNIQUE,
    compress_type      TEXT NOT NULL DEFAULT 'none',
    max_rate           INTEGER NOT NULL DEFAULT 0,
    label              TEXT NOT NULL DEFAULT 'PGBUNKER BASEBACKUP',
    fast_checkpoint    INTEGER NOT NULL DEFAULT 0,
    include_wal        INTEGER NOT NULL DEFAULT 0,
    wait_for_wal       INTEGER NOT NULL DEFAULT 1,
    noverify_checksums INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS backup (
    id               INTEGER PRIMARY KEY,
    archive_id       INTEGER NOT NULL REFERENCES archive(id) ON DELETE CASCADE,
    xlogpos          TEXT NOT NULL DEFAULT '',
    xlogposend       TEXT NOT NULL DEFAULT '',
    timeline         INTEGER NOT NULL DEFAULT 0,
    label            TEXT NOT NULL DEFAULT '',
    fsentry          TEXT NOT NULL DEFAULT '',
    started          TEXT NOT NULL DEFAULT '',
    stopped          TEXT NOT NULL DEFAULT '',
    pinned           INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'in progress',
    systemid         TEXT NOT NULL DEFAULT '',
    wal_segment_size INTEGER NOT NULL DEFAULT 0,
    used_profile     INTEGER NOT NULL DEFAULT -1
);

CREATE TABLE IF NOT EXISTS backup_tablespaces (
    id          INTEGER PRIMARY KEY,
    backup_id   INTEGER NOT NULL REFERENCES backup(id) ON DELETE CASCADE,
    spcoid      INTEGER NOT NULL DEFAULT 0,
    spclocation TEXT NOT NULL DEFAULT '',
    spcsize     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS retention (
    id      INTEGER PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retention_rules (
    id           INTEGER PRIMARY KEY,
    retention_id INTEGER NOT NULL REFERENCES retention(id) ON DELETE CASCADE,
    seq          INTEGER NOT NULL,
    type         INTEGER NOT NULL,
    value        TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_backup_archive ON backup(archive_id, started);
";

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// The backup catalog handle. Exclusively owns its database file for the
/// duration of `open_rw()`; never share a handle across processes.
pub struct BackupCatalog {
    path: PathBuf,
    conn: Option<Connection>,
    tx_in_progress: bool,
}

impl BackupCatalog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: None,
            tx_in_progress: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the catalog read-write, creating the schema if absent.
    /// Idempotent.
    pub fn open_rw(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;

        // The reserved default profile is a regular row, nothing is
        // hard-coded in the engine.
        conn.execute(
            "INSERT OR IGNORE INTO backup_profiles (name) VALUES ('default')",
            [],
        )?;

        debug!("backup catalog opened at {}", self.path.display());
        self.conn = Some(conn);
        Ok(())
    }

    pub fn available(&self) -> bool {
        self.conn.is_some()
    }

    /// Closes the catalog. Idempotent.
    pub fn close(&mut self) {
        self.conn = None;
        self.tx_in_progress = false;
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| CatalogError::catalog("catalog not opened, call open_rw() first"))
    }

    /// Starts the single transaction framing one logical operation. The
    /// write lock serializes commands across handles.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.tx_in_progress {
            return Err(CatalogError::catalog("transaction already in progress"));
        }
        self.conn()?.execute_batch("BEGIN IMMEDIATE")?;
        self.tx_in_progress = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.tx_in_progress {
            return Err(CatalogError::catalog("no transaction in progress"));
        }
        self.conn()?.execute_batch("COMMIT")?;
        self.tx_in_progress = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.tx_in_progress {
            return Err(CatalogError::catalog("no transaction in progress"));
        }
        self.conn()?.execute_batch("ROLLBACK")?;
        self.tx_in_progress = false;
        Ok(())
    }

    /* ---------------------------------------------------------------
     * Archives
     * --------------------------------------------------------------- */

    /// Looks up an archive by directory. The returned descriptor carries
    /// `id = -1` when no such archive exists.
    pub fn exists(&self, directory: &str) -> Result<CatalogDescr> {
        self.archive_lookup("directory", directory)
    }

    /// Looks up an archive by name, same contract as `exists()`.
    pub fn exists_by_name(&self, name: &str) -> Result<CatalogDescr> {
        self.archive_lookup("name", name)
    }

    fn archive_lookup(&self, column: &str, key: &str) -> Result<CatalogDescr> {
        let sql =
            format!("SELECT id, name, directory, compression FROM archive WHERE {column} = ?1");
        let row = self
            .conn()?
            .query_row(&sql, params![key], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })
            .optional()?;

        let mut descr = CatalogDescr::new(CatalogTag::Empty);
        if let Some((id, name, directory, compression)) = row {
            descr.id = id;
            descr.archive_name = name;
            descr.directory = directory;
            descr.compression = compression;
        }
        Ok(descr)
    }

    /// Inserts a new archive and assigns its id to the descriptor and the
    /// embedded connection descriptor.
    pub fn create_archive(&self, descr: &mut CatalogDescr) -> Result<()> {
        if descr.archive_name.is_empty() {
            return Err(CatalogError::catalog("archive name must not be empty"));
        }

        self.conn()?.execute(
            "INSERT INTO archive (name, directory, compression) VALUES (?1, ?2, ?3)",
            params![descr.archive_name, descr.directory, descr.compression],
        )?;

        descr.id = self.conn()?.last_insert_rowid();
        descr.coninfo.archive_id = descr.id;
        Ok(())
    }

    fn archive_value(descr: &CatalogDescr, attr: ArchiveAttr) -> Value {
        match attr {
            ArchiveAttr::Id => Value::Integer(descr.id),
            ArchiveAttr::Name => Value::Text(descr.archive_name.clone()),
            ArchiveAttr::Directory => Value::Text(descr.directory.clone()),
            ArchiveAttr::Compression => Value::Integer(descr.compression as i64),
        }
    }

    /// Updates exactly the columns named by `attrs`. An empty set is a
    /// no-op and touches nothing.
    pub fn update_archive_attributes(
        &self,
        descr: &CatalogDescr,
        attrs: &AttributeSet<ArchiveAttr>,
    ) -> Result<()> {
        if attrs.is_empty() {
            return Ok(());
        }

        let set_list = attrs
            .get()
            .iter()
            .map(|a| format!("{} = ?", a.column()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE archive SET {set_list} WHERE id = ?");

        let mut values: Vec<Value> = attrs
            .get()
            .iter()
            .map(|a| Self::archive_value(descr, *a))
            .collect();
        values.push(Value::Integer(descr.id));

        self.conn()?.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Drops an archive by name, cascading connections, backups and their
    /// tablespaces.
    pub fn drop_archive(&self, name: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM archive WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// All archives, with their basebackup connection fields filled.
    pub fn get_archive_list(&self) -> Result<Vec<CatalogDescr>> {
        self.archive_list_where("", &[])
    }

    /// Archives matching the descriptor fields named by `attrs`, used by
    /// the filtered and detail list modes.
    pub fn get_archive_list_filtered(
        &self,
        descr: &CatalogDescr,
        attrs: &AttributeSet<ArchiveAttr>,
    ) -> Result<Vec<CatalogDescr>> {
        if attrs.is_empty() {
            return self.get_archive_list();
        }

        let predicate = attrs
            .get()
            .iter()
            .map(|a| format!("a.{} = ?", a.column()))
            .collect::<Vec<_>>()
            .join(" AND ");
        let values: Vec<Value> = attrs
            .get()
            .iter()
            .map(|a| Self::archive_value(descr, *a))
            .collect();

        self.archive_list_where(&format!("WHERE {predicate}"), &values)
    }

    fn archive_list_where(&self, where_clause: &str, values: &[Value]) -> Result<Vec<CatalogDescr>> {
        let sql = format!(
            "SELECT a.id, a.name, a.directory, a.compression, \
                    COALESCE(c.dsn, ''), COALESCE(c.pghost, ''), COALESCE(c.pgport, -1), \
                    COALESCE(c.pguser, ''), COALESCE(c.pgdatabase, '') \
             FROM archive a \
             LEFT JOIN connections c ON c.archive_id = a.id AND c.type = 'basebackup' \
             {where_clause} ORDER BY a.name"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().cloned()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut archives = Vec::new();
        for row in rows {
            let (id, name, directory, compression, dsn, pghost, pgport, pguser, pgdatabase) = row?;
            let mut descr = CatalogDescr::new(CatalogTag::Empty);
            descr.id = id;
            descr.archive_name = name;
            descr.directory = directory;
            descr.compression = compression;
            descr.coninfo.archive_id = id;
            descr.coninfo.contype = ConnectionType::Basebackup;
            descr.coninfo.dsn = dsn;
            descr.coninfo.pghost = pghost;
            descr.coninfo.pgport = pgport;
            descr.coninfo.pguser = pguser;
            descr.coninfo.pgdatabase = pgdatabase;
            archives.push(descr);
        }
        Ok(archives)
    }

    /* ---------------------------------------------------------------
     * Connections
     * --------------------------------------------------------------- */

    pub fn create_catalog_connection(&self, con: &ConnectionDescr) -> Result<()> {
        if con.archive_id < 0 {
            return Err(CatalogError::catalog(
                "connection requires a valid archive id",
            ));
        }

        self.conn()?.execute(
            "INSERT INTO connections (archive_id, type, dsn, pghost, pgport, pguser, pgdatabase) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                con.archive_id,
                con.contype.as_str(),
                con.dsn,
                con.pghost,
                con.pgport,
                con.pguser,
                con.pgdatabase
            ],
        )?;
        Ok(())
    }

    /// Fills the provided descriptor with the `(archive_id, type)` row.
    /// Sets `archive_id = -1` on the descriptor if no such row exists.
    pub fn get_catalog_connection_into(
        &self,
        con: &mut ConnectionDescr,
        archive_id: i64,
        contype: ConnectionType,
    ) -> Result<()> {
        let row = self
            .conn()?
            .query_row(
                "SELECT archive_id, type, dsn, pghost, pgport, pguser, pgdatabase \
                 FROM connections WHERE archive_id = ?1 AND type = ?2",
                params![archive_id, contype.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((archive_id, contype, dsn, pghost, pgport, pguser, pgdatabase)) => {
                con.archive_id = archive_id;
                con.contype = ConnectionType::parse(&contype)?;
                con.dsn = dsn;
                con.pghost = pghost;
                con.pgport = pgport;
                con.pguser = pguser;
                con.pgdatabase = pgdatabase;
            }
            None => {
                con.archive_id = -1;
            }
        }
        Ok(())
    }

    /// All connections of an archive, ordered by type.
    pub fn get_catalog_connections(&self, archive_id: i64) -> Result<Vec<ConnectionDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT archive_id, type, dsn, pghost, pgport, pguser, pgdatabase \
             FROM connections WHERE archive_id = ?1 ORDER BY type",
        )?;

        let rows = stmt.query_map(params![archive_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut connections = Vec::new();
        for row in rows {
            let (archive_id, contype, dsn, pghost, pgport, pguser, pgdatabase) = row?;
            let mut con = ConnectionDescr::new();
            con.archive_id = archive_id;
            con.contype = ConnectionType::parse(&contype)?;
            con.dsn = dsn;
            con.pghost = pghost;
            con.pgport = pgport;
            con.pguser = pguser;
            con.pgdatabase = pgdatabase;
            connections.push(con);
        }
        Ok(connections)
    }

    pub fn drop_catalog_connection(&self, archive_name: &str, contype: ConnectionType) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM connections WHERE type = ?1 \
             AND archive_id = (SELECT id FROM archive WHERE name = ?2)",
            params![contype.as_str(), archive_name],
        )?;
        Ok(())
    }

    /* ---------------------------------------------------------------
     * Backup profiles
     * --------------------------------------------------------------- */

    fn profile_value(descr: &BackupProfileDescr, attr: ProfileAttr) -> Value {
        match attr {
            ProfileAttr::Id => Value::Integer(descr.profile_id),
            ProfileAttr::Name => Value::Text(descr.name.clone()),
            ProfileAttr::CompressType => Value::Text(descr.compress_type.as_str().to_string()),
            ProfileAttr::MaxRate => Value::Integer(descr.max_rate as i64),
            ProfileAttr::Label => Value::Text(descr.label.clone()),
            ProfileAttr::FastCheckpoint => Value::Integer(descr.fast_checkpoint as i64),
            ProfileAttr::IncludeWal => Value::Integer(descr.include_wal as i64),
            ProfileAttr::WaitForWal => Value::Integer(descr.wait_for_wal as i64),
            ProfileAttr::NoverifyChecksums => Value::Integer(descr.noverify_checksums as i64),
        }
    }

    /// Inserts a profile with exactly the columns named by its affected
    /// attributes; omitted columns take their schema defaults.
    pub fn create_backup_profile(&self, descr: &mut BackupProfileDescr) -> Result<()> {
        let attrs: Vec<ProfileAttr> = if descr.attrs.is_empty() {
            ProfileAttr::required_for_create()
        } else {
            descr.attrs.get().to_vec()
        };

        let cols = attrs
            .iter()
            .map(|a| a.column())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; attrs.len()].join(", ");
        let sql = format!("INSERT INTO backup_profiles ({cols}) VALUES ({placeholders})");

        let values: Vec<Value> = attrs
            .iter()
            .map(|a| Self::profile_value(descr, *a))
            .collect();

        self.conn()?.execute(&sql, params_from_iter(values))?;
        descr.profile_id = self.conn()?.last_insert_rowid();
        Ok(())
    }

    /// Looks up a profile by name; `profile_id = -1` signals absence.
    pub fn get_backup_profile(&self, name: &str) -> Result<BackupProfileDescr> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, name, compress_type, max_rate, label, fast_checkpoint, \
                        include_wal, wait_for_wal, noverify_checksums \
                 FROM backup_profiles WHERE name = ?1",
                params![name],
                Self::profile_row,
            )
            .optional()?;

        match row {
            Some(raw) => Self::profile_from_raw(raw),
            None => Ok(BackupProfileDescr::new()),
        }
    }

    pub fn get_backup_profiles(&self) -> Result<Vec<BackupProfileDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, compress_type, max_rate, label, fast_checkpoint, \
                    include_wal, wait_for_wal, noverify_checksums \
             FROM backup_profiles ORDER BY name",
        )?;

        let rows = stmt.query_map([], Self::profile_row)?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(Self::profile_from_raw(row?)?);
        }
        Ok(profiles)
    }

    #[allow(clippy::type_complexity)]
    fn profile_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(i64, String, String, i64, String, bool, bool, bool, bool)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    }

    fn profile_from_raw(
        raw: (i64, String, String, i64, String, bool, bool, bool, bool),
    ) -> Result<BackupProfileDescr> {
        let (id, name, compress, max_rate, label, fast, wal, wait, noverify) = raw;
        Ok(BackupProfileDescr {
            profile_id: id,
            name,
            compress_type: BackupCompressType::parse(&compress)?,
            max_rate: max_rate.max(0) as u32,
            label,
            fast_checkpoint: fast,
            include_wal: wal,
            wait_for_wal: wait,
            noverify_checksums: noverify,
            attrs: AttributeSet::new(),
        })
    }

    pub fn drop_backup_profile(&self, name: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM backup_profiles WHERE name = ?1", params![name])?;
        Ok(())
    }

    /* ---------------------------------------------------------------
     * Basebackup lifecycle
     * --------------------------------------------------------------- */

    /// Registers a started basebackup with status `in progress` and
    /// assigns its id.
    pub fn register_basebackup(&self, archive_id: i64, descr: &mut BaseBackupDescr) -> Result<()> {
        descr.archive_id = archive_id;
        descr.status = BackupStatus::InProgress;
        if descr.started.is_empty() {
            descr.started = now_str();
        }

        self.conn()?.execute(
            "INSERT INTO backup (archive_id, xlogpos, timeline, label, fsentry, started, \
                                 status, systemid, wal_segment_size, used_profile) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                descr.archive_id,
                descr.xlogpos,
                descr.timeline,
                descr.label,
                descr.fsentry,
                descr.started,
                descr.status.as_str(),
                descr.systemid,
                descr.wal_segment_size as i64,
                descr.used_profile
            ],
        )?;

        descr.id = self.conn()?.last_insert_rowid();
        Ok(())
    }

    /// Marks a registered basebackup as aborted. `stopped` stays unset.
    pub fn abort_basebackup(&self, descr: &BaseBackupDescr) -> Result<()> {
        let rows = self.conn()?.execute(
            "UPDATE backup SET status = ?1 WHERE id = ?2",
            params![BackupStatus::Aborted.as_str(), descr.id],
        )?;
        if rows == 0 {
            return Err(CatalogError::catalog(format!(
                "basebackup {} is not registered",
                descr.id
            )));
        }
        Ok(())
    }

    /// Transitions a basebackup from `in progress` to `ready`, recording
    /// `stopped` and the final WAL position.
    pub fn finalize_basebackup(&self, descr: &mut BaseBackupDescr) -> Result<()> {
        let status: Option<String> = self
            .conn()?
            .query_row(
                "SELECT status FROM backup WHERE id = ?1",
                params![descr.id],
                |row| row.get(0),
            )
            .optional()?;

        match status.as_deref() {
            Some("in progress") => {}
            Some(other) => {
                return Err(CatalogError::catalog(format!(
                    "cannot finalize basebackup {} with status \"{other}\"",
                    descr.id
                )))
            }
            None => {
                return Err(CatalogError::catalog(format!(
                    "basebackup {} is not registered",
                    descr.id
                )))
            }
        }

        descr.stopped = now_str();
        descr.status = BackupStatus::Ready;

        self.conn()?.execute(
            "UPDATE backup SET status = ?1, stopped = ?2, xlogposend = ?3 WHERE id = ?4",
            params![
                descr.status.as_str(),
                descr.stopped,
                descr.xlogposend,
                descr.id
            ],
        )?;
        Ok(())
    }

    /// Records one streamed tablespace for a registered basebackup.
    pub fn register_tablespace_for_backup(&self, descr: &mut BackupTablespaceDescr) -> Result<()> {
        if descr.backup_id < 0 {
            return Err(CatalogError::catalog(
                "tablespace registration requires a registered basebackup",
            ));
        }

        self.conn()?.execute(
            "INSERT INTO backup_tablespaces (backup_id, spcoid, spclocation, spcsize) \
             VALUES (?1, ?2, ?3, ?4)",
            params![descr.backup_id, descr.spcoid, descr.spclocation, descr.spcsize],
        )?;
        descr.id = self.conn()?.last_insert_rowid();
        Ok(())
    }

    /// All basebackups of an archive, newest first, tablespaces included.
    pub fn get_backup_list(&self, archive_id: i64) -> Result<Vec<BaseBackupDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, archive_id, xlogpos, xlogposend, timeline, label, fsentry, \
                    started, stopped, pinned, status, systemid, wal_segment_size, used_profile \
             FROM backup WHERE archive_id = ?1 ORDER BY started DESC, id DESC",
        )?;

        let rows = stmt.query_map(params![archive_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
                row.get::<_, i64>(12)?,
                row.get::<_, i64>(13)?,
            ))
        })?;

        let mut backups = Vec::new();
        for row in rows {
            let (
                id,
                archive_id,
                xlogpos,
                xlogposend,
                timeline,
                label,
                fsentry,
                started,
                stopped,
                pinned,
                status,
                systemid,
                wal_segment_size,
                used_profile,
            ) = row?;

            let mut descr = BaseBackupDescr::new();
            descr.id = id;
            descr.archive_id = archive_id;
            descr.xlogpos = xlogpos;
            descr.xlogposend = xlogposend;
            descr.timeline = timeline;
            descr.label = label;
            descr.fsentry = fsentry;
            descr.started = started;
            descr.stopped = stopped;
            descr.pinned = pinned;
            descr.status = BackupStatus::parse(&status)?;
            descr.systemid = systemid;
            descr.wal_segment_size = wal_segment_size.max(0) as u64;
            descr.used_profile = used_profile;
            descr.tablespaces = self.tablespaces_for_backup(id)?;
            backups.push(descr);
        }
        Ok(backups)
    }

    fn tablespaces_for_backup(&self, backup_id: i64) -> Result<Vec<BackupTablespaceDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, backup_id, spcoid, spclocation, spcsize \
             FROM backup_tablespaces WHERE backup_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![backup_id], |row| {
            Ok(BackupTablespaceDescr {
                id: row.get(0)?,
                backup_id: row.get(1)?,
                spcoid: row.get(2)?,
                spclocation: row.get(3)?,
                spcsize: row.get(4)?,
            })
        })?;

        let mut tablespaces = Vec::new();
        for row in rows {
            tablespaces.push(row?);
        }
        Ok(tablespaces)
    }

    /* ---------------------------------------------------------------
     * Pin / unpin
     * --------------------------------------------------------------- */

    /// Applies a PIN/UNPIN action to the backups of an archive inside the
    /// caller's transaction. Returns the number of affected backups.
    pub fn perform_pin_action(&self, archive_id: i64, pin: &PinDescr) -> Result<usize> {
        let unpin = pin.tag == CatalogTag::UnpinBasebackup;

        let update_one = |id: i64| -> Result<usize> {
            let sql = if unpin {
                "UPDATE backup SET pinned = CASE WHEN pinned > 0 THEN pinned - 1 ELSE 0 END \
                 WHERE id = ?1 AND archive_id = ?2"
            } else {
                "UPDATE backup SET pinned = pinned + 1 WHERE id = ?1 AND archive_id = ?2"
            };
            Ok(self.conn()?.execute(sql, params![id, archive_id])?)
        };

        match pin.operation {
            PinOperation::Id(id) => {
                let rows = update_one(id)?;
                if rows == 0 {
                    return Err(CatalogError::archive(format!(
                        "basebackup {id} does not exist in this archive"
                    )));
                }
                Ok(rows)
            }

            PinOperation::Count(count) => {
                // Applied in ascending order of creation date.
                let ids = self.backup_ids_ordered(archive_id, "ASC", count as i64)?;
                let mut affected = 0;
                for id in ids {
                    affected += update_one(id)?;
                }
                Ok(affected)
            }

            PinOperation::Newest => {
                let ids = self.backup_ids_ordered(archive_id, "DESC", 1)?;
                match ids.first() {
                    Some(&id) => update_one(id),
                    None => Err(CatalogError::archive("archive has no basebackups")),
                }
            }

            PinOperation::Oldest => {
                let ids = self.backup_ids_ordered(archive_id, "ASC", 1)?;
                match ids.first() {
                    Some(&id) => update_one(id),
                    None => Err(CatalogError::archive("archive has no basebackups")),
                }
            }

            PinOperation::Pinned => {
                if !unpin {
                    return Err(CatalogError::catalog(
                        "PINNED is only valid for UNPIN actions",
                    ));
                }
                Ok(self.conn()?.execute(
                    "UPDATE backup SET pinned = 0 WHERE archive_id = ?1 AND pinned > 0",
                    params![archive_id],
                )?)
            }
        }
    }

    fn backup_ids_ordered(&self, archive_id: i64, order: &str, limit: i64) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM backup WHERE archive_id = ?1 ORDER BY started {order}, id {order} LIMIT ?2"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![archive_id, limit], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /* ---------------------------------------------------------------
     * Statistics
     * --------------------------------------------------------------- */

    /// Aggregate statistics for one archive.
    pub fn stat_catalog(&self, archive_name: &str) -> Result<StatCatalogArchive> {
        let row = self
            .conn()?
            .query_row(
                "SELECT a.id, a.name, a.directory, COALESCE(c.pghost, ''), \
                        COUNT(b.id), \
                        COALESCE(SUM(b.status = 'aborted'), 0), \
                        COALESCE(SUM(b.status = 'in progress'), 0), \
                        COALESCE((SELECT SUM(t.spcsize) FROM backup_tablespaces t \
                                  JOIN backup b2 ON t.backup_id = b2.id \
                                  WHERE b2.archive_id = a.id), 0), \
                        COALESCE(AVG(CASE WHEN b.status = 'ready' \
                                  THEN strftime('%s', b.stopped) - strftime('%s', b.started) \
                                  END), 0), \
                        COALESCE(MAX(CASE WHEN b.status = 'ready' THEN b.stopped END), '') \
                 FROM archive a \
                 LEFT JOIN connections c ON c.archive_id = a.id AND c.type = 'basebackup' \
                 LEFT JOIN backup b ON b.archive_id = a.id \
                 WHERE a.name = ?1 \
                 GROUP BY a.id",
                params![archive_name],
                |row| {
                    Ok(StatCatalogArchive {
                        archive_id: row.get(0)?,
                        archive_name: row.get(1)?,
                        archive_directory: row.get(2)?,
                        archive_host: row.get(3)?,
                        number_of_backups: row.get(4)?,
                        backups_failed: row.get(5)?,
                        backups_running: row.get(6)?,
                        estimated_total_size: row.get::<_, i64>(7)?.max(0) as u64,
                        avg_backup_duration: row.get::<_, f64>(8)?.max(0.0) as u64,
                        latest_finished: row.get(9)?,
                    })
                },
            )
            .optional()?;

        row.ok_or_else(|| {
            CatalogError::archive(format!("archive \"{archive_name}\" does not exist"))
        })
    }

    /* ---------------------------------------------------------------
     * Retention policies
     * --------------------------------------------------------------- */

    /// Persists a retention policy and its ordered rules; assigns ids.
    pub fn create_retention_policy(&self, descr: &mut RetentionDescr) -> Result<()> {
        if descr.name.is_empty() {
            return Err(CatalogError::catalog("retention policy name must not be empty"));
        }
        if descr.rules.is_empty() {
            return Err(CatalogError::catalog(format!(
                "retention policy \"{}\" has no rules",
                descr.name
            )));
        }

        descr.created = now_str();
        self.conn()?.execute(
            "INSERT INTO retention (name, created) VALUES (?1, ?2)",
            params![descr.name, descr.created],
        )?;
        descr.id = self.conn()?.last_insert_rowid();

        for (seq, rule) in descr.rules.iter_mut().enumerate() {
            self.conn()?.execute(
                "INSERT INTO retention_rules (retention_id, seq, type, value) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![descr.id, seq as i64, rule.rule_type.to_i64(), rule.value],
            )?;
            rule.id = self.conn()?.last_insert_rowid();
        }
        Ok(())
    }

    /// Looks up a policy with its rules; `id = -1` signals absence.
    pub fn get_retention_policy(&self, name: &str) -> Result<RetentionDescr> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, name, created FROM retention WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let mut descr = RetentionDescr::new();
        if let Some((id, name, created)) = row {
            descr.id = id;
            descr.name = name;
            descr.created = created;
            descr.rules = self.rules_for_policy(id)?;
        }
        Ok(descr)
    }

    pub fn get_retention_policies(&self) -> Result<Vec<RetentionDescr>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, created FROM retention ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut policies = Vec::new();
        for row in rows {
            let (id, name, created) = row?;
            let mut descr = RetentionDescr::new();
            descr.id = id;
            descr.name = name;
            descr.created = created;
            descr.rules = self.rules_for_policy(id)?;
            policies.push(descr);
        }
        Ok(policies)
    }

    fn rules_for_policy(&self, retention_id: i64) -> Result<Vec<RetentionRuleDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, value FROM retention_rules WHERE retention_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![retention_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut rules = Vec::new();
        for row in rows {
            let (id, rule_type, value) = row?;
            let mut rule = RetentionRuleDescr::new(RetentionRuleId::from_i64(rule_type)?, value);
            rule.id = id;
            rules.push(rule);
        }
        Ok(rules)
    }

    pub fn drop_retention_policy(&self, name: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM retention WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Applies a policy to an archive and computes the cleanup
    /// descriptor. Catalog state is not modified; eviction itself is the
    /// caller's business.
    pub fn apply_retention_policy(
        &self,
        archive_name: &str,
        policy_name: &str,
    ) -> Result<BackupCleanupDescr> {
        let archive = self.exists_by_name(archive_name)?;
        if archive.id < 0 {
            return Err(CatalogError::archive(format!(
                "archive \"{archive_name}\" does not exist"
            )));
        }

        let policy = self.get_retention_policy(policy_name)?;
        if policy.id < 0 {
            return Err(CatalogError::catalog(format!(
                "retention policy \"{policy_name}\" does not exist"
            )));
        }

        let backups = self.get_backup_list(archive.id)?;

        // Interval rules compare against a threshold computed by the
        // catalog's own datetime arithmetic.
        let mut thresholds = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            if rule.rule_type.takes_interval() {
                let interval = RetentionIntervalDescr::parse(&rule.value)?;
                thresholds.push(Some(self.eval_datetime(&interval)?));
            } else {
                thresholds.push(None);
            }
        }

        retention::compute_cleanup(backups, &policy.rules, &thresholds)
    }

    fn eval_datetime(&self, interval: &RetentionIntervalDescr) -> Result<String> {
        let sql = format!("SELECT {}", interval.sqlite_datetime());
        Ok(self.conn()?.query_row(&sql, [], |row| row.get(0))?)
    }
}
