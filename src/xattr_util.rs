//! Extended-attribute helper for the `user.md.size` sidecar protocol (spec §6).
//!
//! Wraps the `xattr` crate, the standard way Rust programs read and write
//! real filesystem extended attributes.

use std::path::Path;

use anyhow::{Context, Result};

const SIZE_ATTR: &str = "user.md.size";

/// Probe whether extended attributes are usable on `path` by round-tripping
/// a throwaway value. `init_path` treats a failure here as "drop this disk".
pub fn supports_xattr(path: &Path) -> bool {
    const PROBE_ATTR: &str = "user.md.probe";
    let probe = [0u8; 1];
    if xattr::set(path, PROBE_ATTR, &probe).is_err() {
        return false;
    }
    let ok = matches!(xattr::get(path, PROBE_ATTR), Ok(Some(v)) if v == probe);
    let _ = xattr::remove(path, PROBE_ATTR);
    ok
}

/// Read `user.md.size` off `path`, if present.
pub fn read_size(path: &Path) -> Result<Option<u64>> {
    let raw = xattr::get(path, SIZE_ATTR).context("failed to read user.md.size")?;
    Ok(raw.map(|bytes| {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        u64::from_le_bytes(buf)
    }))
}

/// Write `user.md.size` on `path`.
pub fn write_size(path: &Path, size: u64) -> Result<()> {
    xattr::set(path, SIZE_ATTR, &size.to_le_bytes()).context("failed to write user.md.size")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        if !supports_xattr(dir.path()) {
            // Extended attributes aren't available on this test filesystem
            // (e.g. overlayfs/tmpfs without xattr support); skip rather than
            // fail the suite for an environment limitation.
            return;
        }

        assert_eq!(read_size(dir.path()).unwrap(), None);
        write_size(dir.path(), 4096).unwrap();
        assert_eq!(read_size(dir.path()).unwrap(), Some(4096));
    }
}
