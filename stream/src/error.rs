use thiserror::Error;

/// Error type for replication stream and archive writer operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection error: {0}")]
    Connect(String),

    #[error("stream identification error: {0}")]
    Identify(String),

    #[error("basebackup stream error: {0}")]
    Basebackup(String),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("compression type {0} is not supported by the archive writer")]
    UnsupportedCompression(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ring error: {0}")]
    Ring(#[from] ringio::RingError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
