//! Aggregate statistics over the backup catalog.

use std::fmt;

/// Builds a dashed separator line of the given width.
pub fn make_line(width: usize) -> String {
    "-".repeat(width)
}

/// Builds a caption followed by a column header row and separators, the
/// layout shared by all list outputs.
pub fn make_header(caption: &str, columns: &str, width: usize) -> String {
    format!(
        "{}\n{}\n{}\n{}\n",
        caption,
        make_line(width),
        columns,
        make_line(width)
    )
}

/// Stat data for one archive and its backups.
#[derive(Debug, Clone, Default)]
pub struct StatCatalogArchive {
    pub archive_id: i64,
    pub archive_name: String,
    pub archive_directory: String,
    pub archive_host: String,

    pub number_of_backups: i64,
    pub backups_failed: i64,
    pub backups_running: i64,

    /// Sum of tablespace sizes over all backups, in bytes.
    pub estimated_total_size: u64,

    /// Average duration of finalized backups, in seconds.
    pub avg_backup_duration: u64,

    pub latest_finished: String,
}

impl StatCatalogArchive {
    pub fn formatted(&self) -> String {
        let mut out = make_header(
            &format!("Catalog status for archive \"{}\"", self.archive_name),
            &format!("{:<20}\t{:<40}", "Property", "Setting"),
            80,
        );

        out.push_str(&format!("{:<20}\t{:<40}\n", "DIRECTORY", self.archive_directory));
        out.push_str(&format!("{:<20}\t{:<40}\n", "PGHOST", self.archive_host));
        out.push_str(&format!("{:<20}\t{:<40}\n", "BACKUPS", self.number_of_backups));
        out.push_str(&format!("{:<20}\t{:<40}\n", "RUNNING", self.backups_running));
        out.push_str(&format!("{:<20}\t{:<40}\n", "FAILED", self.backups_failed));
        out.push_str(&format!(
            "{:<20}\t{:<40}\n",
            "ESTIMATED SIZE",
            pretty_size(self.estimated_total_size)
        ));
        out.push_str(&format!(
            "{:<20}\t{:<40}\n",
            "AVG DURATION",
            format!("{} s", self.avg_backup_duration)
        ));
        out.push_str(&format!(
            "{:<20}\t{:<40}\n",
            "LATEST FINISHED",
            if self.latest_finished.is_empty() {
                "N/A"
            } else {
                self.latest_finished.as_str()
            }
        ));
        out
    }
}

impl fmt::Display for StatCatalogArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

/// Formats a byte count into kB, MB or GB.
pub fn pretty_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} kB", size as f64 / KB as f64)
    } else {
        format!("{size} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_size_scales() {
        assert_eq!(pretty_size(512), "512 B");
        assert_eq!(pretty_size(2048), "2.00 kB");
        assert_eq!(pretty_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn formatted_stat_names_the_archive() {
        let stat = StatCatalogArchive {
            archive_name: "pg1".into(),
            ..Default::default()
        };
        let out = stat.formatted();
        assert!(out.contains("pg1"));
        assert!(out.contains("LATEST FINISHED"));
    }
}
