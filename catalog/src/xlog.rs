//! WAL position helpers.
//!
//! Positions travel through the catalog in the server's `X/Y` textual
//! form; retention arithmetic needs them as plain 64-bit offsets.

use crate::error::{CatalogError, Result};

/// The invalid/unset WAL position.
pub const INVALID_XLOG_POS: u64 = 0;

/// Parses a `hi/lo` hexadecimal WAL position, e.g. `0/3000060`.
pub fn parse_xlog_pos(input: &str) -> Result<u64> {
    let (hi, lo) = input
        .split_once('/')
        .ok_or_else(|| CatalogError::catalog(format!("malformed WAL position \"{input}\"")))?;

    let hi = u64::from_str_radix(hi.trim(), 16)
        .map_err(|_| CatalogError::catalog(format!("malformed WAL position \"{input}\"")))?;
    let lo = u64::from_str_radix(lo.trim(), 16)
        .map_err(|_| CatalogError::catalog(format!("malformed WAL position \"{input}\"")))?;

    if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
        return Err(CatalogError::catalog(format!(
            "WAL position \"{input}\" out of range"
        )));
    }

    Ok((hi << 32) | lo)
}

/// Formats a 64-bit WAL position back into the `hi/lo` form.
pub fn format_xlog_pos(pos: u64) -> String {
    format!("{:X}/{:X}", pos >> 32, pos & 0xFFFF_FFFF)
}

/// Start position of the WAL segment containing `pos`.
pub fn segment_start(pos: u64, wal_segment_size: u64) -> u64 {
    if wal_segment_size == 0 {
        return pos;
    }
    pos - (pos % wal_segment_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for s in ["0/0", "0/3000060", "2A/FF001122", "FFFFFFFF/FFFFFFFF"] {
            let parsed = parse_xlog_pos(s).unwrap();
            assert_eq!(parse_xlog_pos(&format_xlog_pos(parsed)).unwrap(), parsed);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_xlog_pos("").is_err());
        assert!(parse_xlog_pos("12345678").is_err());
        assert!(parse_xlog_pos("zz/00").is_err());
        assert!(parse_xlog_pos("1/100000000").is_err());
    }

    #[test]
    fn segment_boundaries() {
        let seg = 16 * 1024 * 1024;
        assert_eq!(segment_start(0, seg), 0);
        assert_eq!(segment_start(seg + 5, seg), seg);
        assert_eq!(segment_start(42, 0), 42);
    }
}
