use thiserror::Error;

/// Error type for catalog operations
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Schema, constraint or lookup failure inside the catalog.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Missing archive, filesystem integrity failure or orchestration
    /// precondition.
    #[error("archive error: {0}")]
    Archive(String),

    /// Underlying catalog database error.
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error while touching archive directories.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    pub fn catalog(msg: impl Into<String>) -> Self {
        CatalogError::Catalog(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        CatalogError::Archive(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
