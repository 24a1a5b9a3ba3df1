//! A single storage path's state and on-disk sidecar protocol (spec §3,
//! §4.2, §6).
//!
//! Statvfs-backed free-space accounting, slimmed to the fields the
//! placement layer actually needs -- no allocator, no fragment bookkeeping,
//! since MDP places whole object files, not erasure-coded fragments.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::xattr_util;

const STALE_DIR: &str = ".stale";

/// Lifecycle state of a disk slot (spec §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Registered,
    Active,
    PendingRemoval,
    Removed,
}

/// One storage path and its ring-weight bookkeeping.
#[derive(Debug, Clone)]
pub struct Disk {
    pub path: PathBuf,
    pub nr_vdisks: u16,
    pub free_space: u64,
    pub state: DiskState,
}

impl Disk {
    /// Register a new disk slot and bring it up through `init_path` and
    /// `init_space`. Returns `None` (never registered) if any
    /// initialization step fails, per spec: "the disk is dropped by the
    /// caller."
    pub fn register(path: PathBuf) -> Option<Disk> {
        let mut disk = Disk {
            path,
            nr_vdisks: 0,
            free_space: 0,
            state: DiskState::Registered,
        };
        match disk.init_path_and_space() {
            Ok(()) => {
                disk.state = DiskState::Active;
                Some(disk)
            }
            Err(e) => {
                log::warn!("dropping disk {}: {}", disk.path.display(), e);
                None
            }
        }
    }

    /// `init_path` + the free-space half of `init_space` (spec §4.2):
    /// verify xattr support, create `.stale/`, read or recompute
    /// `user.md.size`, then read free space off the filesystem.
    fn init_path_and_space(&mut self) -> Result<()> {
        if !xattr_util::supports_xattr(&self.path) {
            anyhow::bail!("extended attributes not supported on {}", self.path.display());
        }

        let stale_dir = self.path.join(STALE_DIR);
        fs::create_dir_all(&stale_dir).context("failed to create .stale directory")?;

        let recorded = match xattr_util::read_size(&self.path)? {
            Some(size) => size,
            None => {
                let scanned = scan_live_object_bytes(&self.path)?;
                xattr_util::write_size(&self.path, scanned)?;
                scanned
            }
        };
        let _ = recorded; // tracked on the path itself; not duplicated on Disk

        self.free_space = statvfs_free_bytes(&self.path)?;
        Ok(())
    }

    /// Re-read free space and refresh `user.md.size` from a live scan.
    /// Called on every ring-affecting transition (spec §3 lifecycle).
    pub fn init_space(&mut self) -> Result<()> {
        let scanned = scan_live_object_bytes(&self.path)?;
        xattr_util::write_size(&self.path, scanned)?;
        self.free_space = statvfs_free_bytes(&self.path)?;
        Ok(())
    }

    /// Build a `Disk` directly from a free-space value, bypassing
    /// filesystem access entirely. Used only by ring/weighting tests.
    #[cfg(test)]
    pub fn for_ring_test(path: PathBuf, free_space: u64) -> Disk {
        Disk {
            path,
            nr_vdisks: 0,
            free_space,
            state: DiskState::Active,
        }
    }
}

fn statvfs_free_bytes(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).context("failed to statvfs disk path")?;
    Ok(stat.blocks_available() * stat.block_size())
}

/// Total filesystem capacity backing `path`, used by `info()`'s `total_space`.
pub fn statvfs_total_bytes(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).context("failed to statvfs disk path")?;
    Ok(stat.blocks() * stat.block_size())
}

/// Sum the size of every live object file directly under `path`
/// (`.tmp` files, `.stale/`, and unparseable names are skipped).
fn scan_live_object_bytes(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(path).context("failed to scan disk path")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if parse_object_name(name).is_none() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Canonical live-object filename: 16 lowercase hex digits.
pub fn object_file_name(oid: u64) -> String {
    format!("{:016x}", oid)
}

/// In-progress write filename: the canonical name plus `.tmp`.
pub fn tmp_file_name(oid: u64) -> String {
    format!("{:016x}.tmp", oid)
}

/// Stale-copy filename under `.stale/`: the canonical name plus `.{epoch}`.
pub fn stale_file_name(oid: u64, epoch: u32) -> String {
    format!("{:016x}.{}", oid, epoch)
}

pub fn stale_dir(disk_path: &Path) -> PathBuf {
    disk_path.join(STALE_DIR)
}

/// Parse a directory entry name as a live object id: exactly 16 lowercase
/// hex digits, nonzero. Dot-prefixed names, `.tmp` files, and anything
/// that fails to parse are not objects and are skipped silently.
pub fn parse_object_name(name: &str) -> Option<u64> {
    if name.starts_with('.') || name.len() != 16 {
        return None;
    }
    let oid = u64::from_str_radix(name, 16).ok()?;
    if oid == 0 {
        None
    } else {
        Some(oid)
    }
}
