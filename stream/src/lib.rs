//! Streaming replication client and basebackup directory writer.

pub mod error;
pub mod pgstream;
pub mod writer;

pub use error::StreamError;
pub use pgstream::{PgStream, ReplicationStream};
pub use writer::StreamBackupWriter;
