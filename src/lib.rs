//! pgbunker: a backup and archiving engine for PostgreSQL.
//!
//! The command layer composes catalog transactions with streaming,
//! filesystem and worker-launch side effects; the `catalog`, `stream` and
//! `ringio` member crates carry the underlying machinery.

pub mod commands;
pub mod error;
pub mod launcher;
pub mod vars;

pub use error::{BunkerError, Result};
