//! The streaming replication client.
//!
//! `ReplicationStream` is the seam between the basebackup orchestrator and
//! the wire protocol; `PgStream` is the production implementation speaking
//! the server's replication protocol over tokio-postgres. Connections are
//! opened with `replication=database`, which keeps plain SQL available for
//! the tablespace inventory.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio_postgres::{Client, CopyOutStream, NoTls, SimpleQueryMessage};

use catalog::{
    BackupProfileDescr, BackupTablespaceDescr, BaseBackupDescr, CatalogDescr,
    StreamIdentification,
};

use crate::error::{Result, StreamError};

/// Operations the basebackup orchestrator invokes on a replication
/// stream. The sequence is connect, identify, start_backup, then
/// tablespace iteration with `step_tablespace`/`next_chunk`, and finally
/// end_backup and disconnect.
#[async_trait]
pub trait ReplicationStream: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Establishes system identity, timeline and WAL segment size.
    async fn identify(&mut self) -> Result<StreamIdentification>;

    /// Begins the basebackup seeded with the profile's tunables and
    /// returns the backup descriptor capturing the start state.
    async fn start_backup(&mut self, profile: &BackupProfileDescr) -> Result<BaseBackupDescr>;

    /// Materializes the tablespace inventory for iteration.
    async fn read_tablespace_info(&mut self) -> Result<()>;

    /// Advances to the next tablespace; `None` once all are consumed.
    async fn step_tablespace(&mut self) -> Result<Option<BackupTablespaceDescr>>;

    /// Next payload chunk of the current tablespace archive; `None` at
    /// the archive boundary.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Ends the stream and captures the final WAL position.
    async fn end_backup(&mut self) -> Result<String>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Production replication stream over tokio-postgres.
pub struct PgStream {
    descr: CatalogDescr,
    ident: StreamIdentification,
    client: Option<Client>,
    driver: Option<tokio::task::JoinHandle<()>>,
    copy: Option<Pin<Box<CopyOutStream>>>,
    inventory: Vec<BackupTablespaceDescr>,
    pending_spaces: VecDeque<BackupTablespaceDescr>,
    in_archive: bool,
    manifest_seen: bool,
}

impl PgStream {
    pub fn new(descr: &CatalogDescr) -> Self {
        let mut owned = CatalogDescr::new(descr.tag);
        owned.copy_from(descr);
        Self {
            descr: owned,
            ident: StreamIdentification::new(),
            client: None,
            driver: None,
            copy: None,
            inventory: Vec::new(),
            pending_spaces: VecDeque::new(),
            in_archive: false,
            manifest_seen: false,
        }
    }

    pub fn identification(&self) -> &StreamIdentification {
        &self.ident
    }

    fn conninfo(&self) -> String {
        let con = &self.descr.coninfo;
        let mut conninfo = if con.dsn.is_empty() {
            format!(
                "host={} port={} dbname={} user={}",
                con.pghost, con.pgport, con.pgdatabase, con.pguser
            )
        } else {
            con.dsn.clone()
        };
        conninfo.push_str(" replication=database");
        conninfo
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| StreamError::Connect("stream is not connected".to_string()))
    }

    fn simple_rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
        messages
            .into_iter()
            .filter_map(|msg| match msg {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect()
    }

    async fn current_server_position(&self) -> Result<String> {
        let rows = Self::simple_rows(self.client()?.simple_query("IDENTIFY_SYSTEM").await?);
        let row = rows
            .first()
            .ok_or_else(|| StreamError::Identify("IDENTIFY_SYSTEM returned no row".to_string()))?;
        Ok(row
            .get(2)
            .ok_or_else(|| StreamError::Identify("IDENTIFY_SYSTEM row has no xlogpos".to_string()))?
            .to_string())
    }
}

#[async_trait]
impl ReplicationStream for PgStream {
    async fn connect(&mut self) -> Result<()> {
        let conninfo = self.conninfo();
        debug!("connecting replication stream: {conninfo}");

        let (client, connection) = tokio_postgres::connect(&conninfo, NoTls)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        // Drive the connection in the background, the teacher's pattern.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("replication connection error: {e}");
            }
        });

        self.client = Some(client);
        self.driver = Some(driver);
        Ok(())
    }

    async fn identify(&mut self) -> Result<StreamIdentification> {
        let rows = Self::simple_rows(self.client()?.simple_query("IDENTIFY_SYSTEM").await?);
        let row = rows
            .first()
            .ok_or_else(|| StreamError::Identify("IDENTIFY_SYSTEM returned no row".to_string()))?;

        self.ident.systemid = row
            .get(0)
            .ok_or_else(|| StreamError::Identify("missing systemid".to_string()))?
            .to_string();
        self.ident.timeline = row
            .get(1)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| StreamError::Identify("missing timeline".to_string()))?;
        self.ident.xlogpos = row
            .get(2)
            .ok_or_else(|| StreamError::Identify("missing xlogpos".to_string()))?
            .to_string();
        self.ident.dbname = self.descr.coninfo.pgdatabase.clone();

        // wal_segment_size is negotiated at connect time; servers report
        // it as a pretty-printed GUC.
        let rows = Self::simple_rows(self.client()?.simple_query("SHOW wal_segment_size").await?);
        if let Some(row) = rows.first() {
            if let Some(raw) = row.get(0) {
                self.ident.wal_segment_size = parse_wal_segment_size(raw)?;
            }
        }

        self.ident.status = StreamIdentification::STREAM_PROGRESS_IDENTIFIED.to_string();
        self.ident.archive_name = self.descr.archive_name.clone();
        info!(
            "identified system {} on timeline {} at {}",
            self.ident.systemid, self.ident.timeline, self.ident.xlogpos
        );
        Ok(self.ident.clone())
    }

    async fn start_backup(&mut self, profile: &BackupProfileDescr) -> Result<BaseBackupDescr> {
        // The tablespace inventory has to be collected before the COPY
        // phase occupies the connection.
        let rows = Self::simple_rows(
            self.client()?
                .simple_query(
                    "SELECT oid, pg_tablespace_location(oid), \
                            pg_tablespace_size(oid) FROM pg_tablespace \
                     WHERE spcname NOT IN ('pg_default', 'pg_global')",
                )
                .await?,
        );

        self.inventory.clear();
        // The main data directory streams first, as tablespace oid 0.
        let mut main = BackupTablespaceDescr::new();
        main.spcoid = 0;
        self.inventory.push(main);

        for row in rows {
            let mut spc = BackupTablespaceDescr::new();
            spc.spcoid = row
                .get(0)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| StreamError::Protocol("malformed tablespace oid".to_string()))?;
            spc.spclocation = row.get(1).unwrap_or_default().to_string();
            spc.spcsize = row.get(2).and_then(|v| v.parse().ok()).unwrap_or(0);
            self.inventory.push(spc);
        }

        let sql = basebackup_command(profile);
        debug!("starting basebackup: {sql}");

        let copy = self
            .client()?
            .copy_out(&sql)
            .await
            .map_err(|e| StreamError::Basebackup(e.to_string()))?;
        self.copy = Some(Box::pin(copy));
        self.in_archive = false;
        self.manifest_seen = false;

        let mut backup = BaseBackupDescr::new();
        backup.label = profile.label.clone();
        backup.started = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        backup.xlogpos = self.ident.xlogpos.clone();
        backup.timeline = self.ident.timeline;
        backup.systemid = self.ident.systemid.clone();
        backup.wal_segment_size = self.ident.wal_segment_size;
        backup.used_profile = profile.profile_id;

        self.ident.status = StreamIdentification::STREAM_PROGRESS_STREAMING.to_string();
        Ok(backup)
    }

    async fn read_tablespace_info(&mut self) -> Result<()> {
        self.pending_spaces = self.inventory.drain(..).collect();
        debug!("{} tablespaces queued for streaming", self.pending_spaces.len());
        Ok(())
    }

    async fn step_tablespace(&mut self) -> Result<Option<BackupTablespaceDescr>> {
        if self.manifest_seen {
            return Ok(None);
        }
        Ok(self.pending_spaces.pop_front())
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let copy = self
            .copy
            .as_mut()
            .ok_or_else(|| StreamError::Basebackup("no basebackup in progress".to_string()))?;

        loop {
            let message = match copy.next().await {
                Some(chunk) => chunk.map_err(|e| StreamError::Basebackup(e.to_string()))?,
                None => {
                    self.in_archive = false;
                    return Ok(None);
                }
            };

            if message.is_empty() {
                continue;
            }

            // Archive framing: 'n' opens an archive, 'd' carries payload,
            // 'p' reports progress, 'm' opens the manifest.
            match message[0] {
                b'd' => return Ok(Some(message.slice(1..))),
                b'n' => {
                    if self.in_archive {
                        // Boundary between tablespace archives.
                        self.in_archive = false;
                        return Ok(None);
                    }
                    self.in_archive = true;
                }
                b'p' => continue,
                b'm' => {
                    self.manifest_seen = true;
                    self.in_archive = false;
                    return Ok(None);
                }
                other => {
                    return Err(StreamError::Protocol(format!(
                        "unexpected basebackup message type {:#04x}",
                        other
                    )))
                }
            }
        }
    }

    async fn end_backup(&mut self) -> Result<String> {
        // Drain whatever the server still has queued, then drop the COPY
        // state before the connection accepts queries again.
        if let Some(copy) = self.copy.as_mut() {
            while let Some(chunk) = copy.next().await {
                chunk.map_err(|e| StreamError::Basebackup(e.to_string()))?;
            }
        }
        self.copy = None;

        let xlogposend = self.current_server_position().await?;
        self.ident.status = StreamIdentification::STREAM_PROGRESS_SHUTDOWN.to_string();
        info!("basebackup stream ended at {xlogposend}");
        Ok(xlogposend)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.copy = None;
        self.client = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        Ok(())
    }
}

/// Builds the BASE_BACKUP command from the profile's tunables.
fn basebackup_command(profile: &BackupProfileDescr) -> String {
    let mut options = vec![format!("LABEL '{}'", profile.label.replace('\'', "''"))];
    options.push("PROGRESS".to_string());

    if profile.fast_checkpoint {
        options.push("CHECKPOINT 'fast'".to_string());
    } else {
        options.push("CHECKPOINT 'spread'".to_string());
    }

    if profile.include_wal {
        options.push("WAL".to_string());
    }
    if profile.wait_for_wal {
        options.push("WAIT".to_string());
    }
    if profile.max_rate > 0 {
        options.push(format!("MAX_RATE {}", profile.max_rate));
    }
    if profile.noverify_checksums {
        options.push("VERIFY_CHECKSUMS false".to_string());
    }

    format!("BASE_BACKUP ({})", options.join(", "))
}

/// Parses the server's pretty-printed wal_segment_size GUC into bytes.
fn parse_wal_segment_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| StreamError::Identify(format!("malformed wal_segment_size \"{raw}\"")))?;

    let factor = match unit.trim() {
        "" | "B" => 1,
        "kB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        other => {
            return Err(StreamError::Identify(format!(
                "unrecognized wal_segment_size unit \"{other}\""
            )))
        }
    };
    Ok(value * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_segment_size_units() {
        assert_eq!(parse_wal_segment_size("16MB").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_wal_segment_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_wal_segment_size("16777216").unwrap(), 16 * 1024 * 1024);
        assert!(parse_wal_segment_size("sixteen").is_err());
    }

    #[test]
    fn basebackup_command_reflects_profile() {
        let mut profile = BackupProfileDescr::new();
        profile.label = "it's nightly".to_string();
        profile.fast_checkpoint = true;
        profile.include_wal = true;
        profile.wait_for_wal = false;
        profile.max_rate = 1024;
        profile.noverify_checksums = true;

        let sql = basebackup_command(&profile);
        assert!(sql.starts_with("BASE_BACKUP ("));
        assert!(sql.contains("LABEL 'it''s nightly'"));
        assert!(sql.contains("CHECKPOINT 'fast'"));
        assert!(sql.contains("WAL"));
        assert!(!sql.contains("WAIT,") && !sql.ends_with("WAIT)"));
        assert!(sql.contains("MAX_RATE 1024"));
        assert!(sql.contains("VERIFY_CHECKSUMS false"));
    }
}
