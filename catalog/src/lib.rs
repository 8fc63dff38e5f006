//! Backup catalog: descriptor model, transactional store, retention
//! policies and catalog statistics.

pub mod descr;
pub mod error;
pub mod retention;
pub mod stat;
pub mod store;
pub mod xlog;

pub use descr::{
    ArchiveAttr, AttributeSet, BackupAttr, BackupCompressType, BackupProfileDescr, BackupStatus,
    BackupTablespaceDescr, BaseBackupDescr, CatalogDescr, CatalogTag, ConnectionAttr,
    ConnectionDescr, ConnectionType, PinDescr, PinOperation, ProfileAttr, RetentionDescr,
    RetentionRuleDescr, StreamIdentification,
};
pub use error::{CatalogError, Result};
pub use retention::{
    BackupCleanupDescr, BasebackupCleanupMode, CleanupItem, RetentionIntervalDescr,
    RetentionParsedAction, RetentionParsedModifier, RetentionParserState, RetentionRuleId,
    WalCleanupMode, XlogCleanupOffset,
};
pub use stat::StatCatalogArchive;
pub use store::BackupCatalog;
