//! Descriptor model for catalog entities.
//!
//! Every descriptor that participates in catalog writes carries an ordered
//! affected-attribute set. Commands populate the set before issuing an
//! update; the store emits exactly those columns, which distinguishes
//! "field explicitly set to its default" from "field omitted".

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::retention::{RetentionParserState, RetentionRuleId};
use crate::xlog;

/// Flags characterizing the action encoded by a catalog descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogTag {
    Empty,
    CreateArchive,
    CreateBackupProfile,
    CreateConnection,
    DropArchive,
    DropBackupProfile,
    DropConnection,
    AlterArchive,
    VerifyArchive,
    StartBasebackup,
    ListArchive,
    ListBackupProfile,
    ListBackupProfileDetail,
    ListBackupCatalog,
    ListConnection,
    PinBasebackup,
    UnpinBasebackup,
    StartLauncher,
    BackgroundWorkerCommand,
    CreateRetentionPolicy,
    ListRetentionPolicies,
    ListRetentionPolicy,
    DropRetentionPolicy,
    ApplyRetentionPolicy,
    ShowVariables,
    ShowVariable,
    SetVariable,
    ResetVariable,
}

impl CatalogTag {
    pub fn name(&self) -> &'static str {
        match self {
            CatalogTag::Empty => "EMPTY",
            CatalogTag::CreateArchive => "CREATE ARCHIVE",
            CatalogTag::CreateBackupProfile => "CREATE BACKUP PROFILE",
            CatalogTag::CreateConnection => "CREATE CONNECTION",
            CatalogTag::DropArchive => "DROP ARCHIVE",
            CatalogTag::DropBackupProfile => "DROP BACKUP PROFILE",
            CatalogTag::DropConnection => "DROP CONNECTION",
            CatalogTag::AlterArchive => "ALTER ARCHIVE",
            CatalogTag::VerifyArchive => "VERIFY ARCHIVE",
            CatalogTag::StartBasebackup => "START BASEBACKUP",
            CatalogTag::ListArchive => "LIST ARCHIVE",
            CatalogTag::ListBackupProfile => "LIST BACKUP PROFILE",
            CatalogTag::ListBackupProfileDetail => "LIST BACKUP PROFILE DETAIL",
            CatalogTag::ListBackupCatalog => "LIST BACKUP CATALOG",
            CatalogTag::ListConnection => "LIST CONNECTION",
            CatalogTag::PinBasebackup => "PIN BASEBACKUP",
            CatalogTag::UnpinBasebackup => "UNPIN BASEBACKUP",
            CatalogTag::StartLauncher => "START LAUNCHER",
            CatalogTag::BackgroundWorkerCommand => "BACKGROUND WORKER COMMAND",
            CatalogTag::CreateRetentionPolicy => "CREATE RETENTION POLICY",
            CatalogTag::ListRetentionPolicies => "LIST RETENTION POLICIES",
            CatalogTag::ListRetentionPolicy => "LIST RETENTION POLICY",
            CatalogTag::DropRetentionPolicy => "DROP RETENTION POLICY",
            CatalogTag::ApplyRetentionPolicy => "APPLY RETENTION POLICY",
            CatalogTag::ShowVariables => "SHOW VARIABLES",
            CatalogTag::ShowVariable => "SHOW VARIABLE",
            CatalogTag::SetVariable => "SET VARIABLE",
            CatalogTag::ResetVariable => "RESET VARIABLE",
        }
    }
}

impl Default for CatalogTag {
    fn default() -> Self {
        CatalogTag::Empty
    }
}

/// Ordered set of column identifiers participating in the next catalog
/// write. Duplicates are ignored, insertion order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSet<A: Copy + Eq> {
    attrs: Vec<A>,
}

impl<A: Copy + Eq> Default for AttributeSet<A> {
    fn default() -> Self {
        Self { attrs: Vec::new() }
    }
}

impl<A: Copy + Eq> AttributeSet<A> {
    pub fn new() -> Self {
        Self { attrs: Vec::new() }
    }

    pub fn push(&mut self, attr: A) {
        if !self.attrs.contains(&attr) {
            self.attrs.push(attr);
        }
    }

    pub fn get(&self) -> &[A] {
        &self.attrs
    }

    pub fn set(&mut self, attrs: Vec<A>) {
        self.attrs.clear();
        for attr in attrs {
            self.push(attr);
        }
    }

    pub fn clear(&mut self) {
        self.attrs.clear();
    }

    pub fn contains(&self, attr: A) -> bool {
        self.attrs.contains(&attr)
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Archive table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveAttr {
    Id,
    Name,
    Directory,
    Compression,
}

impl ArchiveAttr {
    pub fn column(&self) -> &'static str {
        match self {
            ArchiveAttr::Id => "id",
            ArchiveAttr::Name => "name",
            ArchiveAttr::Directory => "directory",
            ArchiveAttr::Compression => "compression",
        }
    }
}

/// Connection table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionAttr {
    ArchiveId,
    Type,
    Dsn,
    PgHost,
    PgPort,
    PgUser,
    PgDatabase,
}

impl ConnectionAttr {
    pub fn column(&self) -> &'static str {
        match self {
            ConnectionAttr::ArchiveId => "archive_id",
            ConnectionAttr::Type => "type",
            ConnectionAttr::Dsn => "dsn",
            ConnectionAttr::PgHost => "pghost",
            ConnectionAttr::PgPort => "pgport",
            ConnectionAttr::PgUser => "pguser",
            ConnectionAttr::PgDatabase => "pgdatabase",
        }
    }
}

/// Backup profile table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileAttr {
    Id,
    Name,
    CompressType,
    MaxRate,
    Label,
    FastCheckpoint,
    IncludeWal,
    WaitForWal,
    NoverifyChecksums,
}

impl ProfileAttr {
    pub fn column(&self) -> &'static str {
        match self {
            ProfileAttr::Id => "id",
            ProfileAttr::Name => "name",
            ProfileAttr::CompressType => "compress_type",
            ProfileAttr::MaxRate => "max_rate",
            ProfileAttr::Label => "label",
            ProfileAttr::FastCheckpoint => "fast_checkpoint",
            ProfileAttr::IncludeWal => "include_wal",
            ProfileAttr::WaitForWal => "wait_for_wal",
            ProfileAttr::NoverifyChecksums => "noverify_checksums",
        }
    }

    /// The full attribute set required to create a new profile row.
    pub fn required_for_create() -> Vec<ProfileAttr> {
        vec![
            ProfileAttr::Name,
            ProfileAttr::CompressType,
            ProfileAttr::MaxRate,
            ProfileAttr::Label,
            ProfileAttr::FastCheckpoint,
            ProfileAttr::IncludeWal,
            ProfileAttr::WaitForWal,
        ]
    }
}

/// Backup table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupAttr {
    Id,
    ArchiveId,
    XlogPos,
    XlogPosEnd,
    Timeline,
    Label,
    FsEntry,
    Started,
    Stopped,
    Pinned,
    Status,
    SystemId,
    WalSegmentSize,
    UsedProfile,
}

impl BackupAttr {
    pub fn column(&self) -> &'static str {
        match self {
            BackupAttr::Id => "id",
            BackupAttr::ArchiveId => "archive_id",
            BackupAttr::XlogPos => "xlogpos",
            BackupAttr::XlogPosEnd => "xlogposend",
            BackupAttr::Timeline => "timeline",
            BackupAttr::Label => "label",
            BackupAttr::FsEntry => "fsentry",
            BackupAttr::Started => "started",
            BackupAttr::Stopped => "stopped",
            BackupAttr::Pinned => "pinned",
            BackupAttr::Status => "status",
            BackupAttr::SystemId => "systemid",
            BackupAttr::WalSegmentSize => "wal_segment_size",
            BackupAttr::UsedProfile => "used_profile",
        }
    }
}

/// Connection roles tied to an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionType {
    Basebackup,
    Streamer,
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Basebackup => "basebackup",
            ConnectionType::Streamer => "streamer",
            ConnectionType::Unknown => "unknown",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "basebackup" => Ok(ConnectionType::Basebackup),
            "streamer" => Ok(ConnectionType::Streamer),
            "unknown" => Ok(ConnectionType::Unknown),
            other => Err(CatalogError::catalog(format!(
                "unrecognized connection type \"{other}\""
            ))),
        }
    }
}

impl Default for ConnectionType {
    fn default() -> Self {
        ConnectionType::Unknown
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a catalog database connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionDescr {
    pub archive_id: i64,
    pub contype: ConnectionType,
    pub pghost: String,
    pub pgport: i64,
    pub pguser: String,
    pub pgdatabase: String,
    pub dsn: String,

    #[serde(skip)]
    pub attrs: AttributeSet<ConnectionAttr>,
}

impl ConnectionDescr {
    pub fn new() -> Self {
        Self {
            archive_id: -1,
            pgport: -1,
            ..Default::default()
        }
    }
}

/// Compression types supported for backup profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupCompressType {
    None,
    Gzip,
    Zstd,
    Pbzip,
    Plain,
}

impl BackupCompressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCompressType::None => "none",
            BackupCompressType::Gzip => "gzip",
            BackupCompressType::Zstd => "zstd",
            BackupCompressType::Pbzip => "pbzip",
            BackupCompressType::Plain => "plain",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "none" => Ok(BackupCompressType::None),
            "gzip" => Ok(BackupCompressType::Gzip),
            "zstd" => Ok(BackupCompressType::Zstd),
            "pbzip" => Ok(BackupCompressType::Pbzip),
            "plain" => Ok(BackupCompressType::Plain),
            other => Err(CatalogError::catalog(format!(
                "unrecognized compression type \"{other}\""
            ))),
        }
    }
}

impl Default for BackupCompressType {
    fn default() -> Self {
        BackupCompressType::None
    }
}

impl std::fmt::Display for BackupCompressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backup profile bundles the tunables parameterizing a basebackup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProfileDescr {
    pub profile_id: i64,
    pub name: String,
    pub compress_type: BackupCompressType,
    /// Transfer cap in kbps, 0 means unlimited.
    pub max_rate: u32,
    pub label: String,
    pub fast_checkpoint: bool,
    pub include_wal: bool,
    pub wait_for_wal: bool,
    pub noverify_checksums: bool,

    #[serde(skip)]
    pub attrs: AttributeSet<ProfileAttr>,
}

impl Default for BackupProfileDescr {
    fn default() -> Self {
        Self {
            profile_id: -1,
            name: String::new(),
            compress_type: BackupCompressType::None,
            max_rate: 0,
            label: "PGBUNKER BASEBACKUP".to_string(),
            fast_checkpoint: false,
            include_wal: false,
            wait_for_wal: true,
            noverify_checksums: false,
            attrs: AttributeSet::new(),
        }
    }
}

impl BackupProfileDescr {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Status of a registered basebackup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    InProgress,
    Ready,
    Aborted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in progress",
            BackupStatus::Ready => "ready",
            BackupStatus::Aborted => "aborted",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "in progress" => Ok(BackupStatus::InProgress),
            "ready" => Ok(BackupStatus::Ready),
            "aborted" => Ok(BackupStatus::Aborted),
            other => Err(CatalogError::catalog(format!(
                "unrecognized backup status \"{other}\""
            ))),
        }
    }
}

impl Default for BackupStatus {
    fn default() -> Self {
        BackupStatus::InProgress
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tablespace meta information recorded for a basebackup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupTablespaceDescr {
    pub id: i64,
    pub backup_id: i64,
    pub spcoid: u32,
    pub spclocation: String,
    pub spcsize: i64,
}

impl BackupTablespaceDescr {
    pub fn new() -> Self {
        Self {
            id: -1,
            backup_id: -1,
            ..Default::default()
        }
    }
}

/// Catalog entry for a running or finalized basebackup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseBackupDescr {
    pub id: i64,
    pub archive_id: i64,
    pub xlogpos: String,
    pub xlogposend: String,
    pub timeline: u32,
    pub label: String,
    pub fsentry: String,
    pub started: String,
    pub stopped: String,
    pub pinned: i64,
    pub status: BackupStatus,
    pub systemid: String,
    pub wal_segment_size: u64,
    pub used_profile: i64,

    /// Tablespaces streamed into this backup.
    pub tablespaces: Vec<BackupTablespaceDescr>,
}

impl Default for BaseBackupDescr {
    fn default() -> Self {
        Self {
            id: -1,
            archive_id: -1,
            xlogpos: String::new(),
            xlogposend: String::new(),
            timeline: 0,
            label: String::new(),
            fsentry: String::new(),
            started: String::new(),
            stopped: String::new(),
            pinned: 0,
            status: BackupStatus::InProgress,
            systemid: String::new(),
            wal_segment_size: 0,
            used_profile: -1,
            tablespaces: Vec::new(),
        }
    }
}

impl BaseBackupDescr {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Represents an identified streaming connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamIdentification {
    pub id: i64,
    pub archive_id: i64,
    pub stype: String,
    pub slot_name: String,
    pub systemid: String,
    pub timeline: u32,
    pub xlogpos: String,
    pub dbname: String,
    pub status: String,
    pub create_date: String,

    /// Configured wal_segment_size, negotiated at connect time.
    pub wal_segment_size: u64,

    pub archive_name: String,
}

impl StreamIdentification {
    pub const STREAM_PROGRESS_IDENTIFIED: &'static str = "IDENTIFIED";
    pub const STREAM_PROGRESS_STREAMING: &'static str = "STREAMING";
    pub const STREAM_PROGRESS_SHUTDOWN: &'static str = "SHUTDOWN";
    pub const STREAM_PROGRESS_FAILED: &'static str = "FAILED";

    pub fn new() -> Self {
        Self {
            id: -1,
            archive_id: -1,
            ..Default::default()
        }
    }

    /// Set properties back to default.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The decoded WAL position from `xlogpos`.
    pub fn xlogpos_decoded(&self) -> Result<u64> {
        xlog::parse_xlog_pos(&self.xlogpos)
    }
}

/// PIN/UNPIN operation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinOperation {
    /// References a basebackup by its ID.
    Id(i64),
    /// Number of basebackups to act on, applied in ascending order of
    /// their creation date.
    Count(u32),
    Newest,
    Oldest,
    /// For unpin only: all currently pinned basebackups.
    Pinned,
}

/// Encapsulates a PIN or UNPIN action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinDescr {
    pub tag: CatalogTag,
    pub operation: PinOperation,
}

impl PinDescr {
    pub fn new(tag: CatalogTag, operation: PinOperation) -> Result<Self> {
        match tag {
            CatalogTag::PinBasebackup => {
                if operation == PinOperation::Pinned {
                    return Err(CatalogError::catalog(
                        "PINNED is only valid for UNPIN actions",
                    ));
                }
            }
            CatalogTag::UnpinBasebackup => {}
            other => {
                return Err(CatalogError::catalog(format!(
                    "{} is not a PIN/UNPIN action",
                    other.name()
                )))
            }
        }
        Ok(Self { tag, operation })
    }
}

/// Catalog representation of a retention rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRuleDescr {
    pub id: i64,
    pub rule_type: RetentionRuleId,
    pub value: String,
}

impl RetentionRuleDescr {
    pub fn new(rule_type: RetentionRuleId, value: impl Into<String>) -> Self {
        Self {
            id: -1,
            rule_type,
            value: value.into(),
        }
    }
}

/// Catalog representation of a retention policy with its ordered rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionDescr {
    pub id: i64,
    pub name: String,
    pub created: String,
    pub rules: Vec<RetentionRuleDescr>,
}

impl RetentionDescr {
    pub fn new() -> Self {
        Self {
            id: -1,
            ..Default::default()
        }
    }
}

/// A catalog descriptor is the single record a parsed user request
/// populates; the command factory selects the matching command from its
/// tag and the command composes catalog operations from its fields.
#[derive(Debug, Clone, Default)]
pub struct CatalogDescr {
    pub tag: CatalogTag,
    pub id: i64,
    pub archive_name: String,
    pub retention_name: String,
    pub label: String,
    pub compression: bool,
    pub directory: String,
    pub basebackup_id: i64,
    pub verbose_output: bool,

    /// Job control: detach a launched worker from the terminal.
    pub detach: bool,

    /// VERIFY option: also check the database connection.
    pub check_connection: bool,

    /// Connection identifier used by this descriptor. An archive can have
    /// multiple connection definitions, but only one is used at a time.
    pub coninfo: ConnectionDescr,

    pub backup_profile: BackupProfileDescr,

    /// Retention parser state used while assembling rule ids.
    pub rps: RetentionParserState,

    /// Only valid after `make_pin_descr()`.
    pin: Option<PinDescr>,

    /// Only valid after `make_retention_descr()`.
    retention: Option<RetentionDescr>,

    pub attrs: AttributeSet<ArchiveAttr>,
}

impl CatalogDescr {
    pub fn new(tag: CatalogTag) -> Self {
        Self {
            tag,
            id: -1,
            basebackup_id: -1,
            detach: true,
            coninfo: ConnectionDescr::new(),
            ..Default::default()
        }
    }

    /// Copies scalar fields, the embedded connection descriptor, the
    /// backup profile, job-control flags and both affected-attribute
    /// sets. Pin and retention sub-descriptors are not copied; they are
    /// attached by the `make_*` methods during parsing.
    pub fn copy_from(&mut self, source: &CatalogDescr) {
        self.tag = source.tag;
        self.id = source.id;
        self.archive_name = source.archive_name.clone();
        self.retention_name = source.retention_name.clone();
        self.label = source.label.clone();
        self.compression = source.compression;
        self.directory = source.directory.clone();
        self.basebackup_id = source.basebackup_id;
        self.verbose_output = source.verbose_output;

        self.coninfo.contype = source.coninfo.contype;
        self.coninfo.pghost = source.coninfo.pghost.clone();
        self.coninfo.pgport = source.coninfo.pgport;
        self.coninfo.pguser = source.coninfo.pguser.clone();
        self.coninfo.pgdatabase = source.coninfo.pgdatabase.clone();
        self.coninfo.dsn = source.coninfo.dsn.clone();

        self.backup_profile = source.backup_profile.clone();

        self.detach = source.detach;

        self.attrs = source.attrs.clone();
        self.coninfo.attrs = source.coninfo.attrs.clone();
    }

    /// Attaches a pin descriptor for a PIN/UNPIN command.
    pub fn make_pin_descr(&mut self, operation: PinOperation) -> Result<()> {
        self.pin = Some(PinDescr::new(self.tag, operation)?);
        Ok(())
    }

    pub fn pin_descr(&self) -> Option<&PinDescr> {
        self.pin.as_ref()
    }

    /// Creates the internal retention policy descriptor if absent.
    pub fn make_retention_descr(&mut self) {
        if self.retention.is_none() {
            let mut descr = RetentionDescr::new();
            descr.name = self.retention_name.clone();
            self.retention = Some(descr);
        }
    }

    /// Appends a rule to the attached retention policy, creating the
    /// policy descriptor if necessary.
    pub fn make_retention_rule(&mut self, rule_type: RetentionRuleId, value: impl Into<String>) {
        self.make_retention_descr();
        if let Some(retention) = self.retention.as_mut() {
            retention.rules.push(RetentionRuleDescr::new(rule_type, value));
        }
    }

    /// Assembles a rule from the current parser state and appends it.
    /// The value is explicitly not checked for emptiness.
    pub fn make_rule_from_parser_state(&mut self, value: impl Into<String>) -> Result<()> {
        let rule_type = self.rps.rule_id()?;
        self.make_retention_rule(rule_type, value);
        Ok(())
    }

    /// Detaches the internal retention policy descriptor.
    pub fn detach_retention_descr(&mut self) {
        self.retention = None;
    }

    pub fn retention_descr(&self) -> Option<&RetentionDescr> {
        self.retention.as_ref()
    }

    pub fn retention_descr_mut(&mut self) -> Option<&mut RetentionDescr> {
        self.retention.as_mut()
    }
}
