//! Utility functions

/// Bytes in one GiB, the unit of the memory limit option
pub const GIB: u64 = 1 << 30;

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Convert a limit in (possibly fractional) GiB to bytes
pub fn gib_to_bytes(gib: f64) -> u64 {
    (gib.max(0.0) * GIB as f64) as u64
}

/// Join a store prefix and a key
pub fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_gib_to_bytes() {
        assert_eq!(gib_to_bytes(64.0), 64 * GIB);
        assert_eq!(gib_to_bytes(0.5), GIB / 2);
        assert_eq!(gib_to_bytes(-1.0), 0);
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", ".zarray"), ".zarray");
        assert_eq!(join_key("2", "0.1.0"), "2/0.1.0");
    }
}
