use thiserror::Error;

/// The single error hierarchy of the engine. Catalog and archive
/// failures travel as `CatalogError` kinds, stream failures as
/// `StreamError`, ring failures carry their numeric reason.
#[derive(Debug, Error)]
pub enum BunkerError {
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),

    #[error(transparent)]
    Stream(#[from] stream::StreamError),

    #[error(transparent)]
    Ring(#[from] ringio::RingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BunkerError>;
