//! Multi-disk placement layer: the consistent-hash data plane over a set
//! of local storage paths (spec §3, §4.2, §5).
//!
//! A thin struct owning operations over a disk array, built around a single
//! `RwLock`-guarded ring instead of per-call candidate filtering, since MDP
//! places whole objects on one disk rather than spreading erasure-coded
//! fragments across several.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use crate::collaborators::RecoveryOrchestrator;
use crate::config::MdConfig;
use crate::disk::{self, Disk, DiskState};
use crate::error::MdError;
use crate::fnv;
use crate::ring::{self, VDisk};
use crate::workqueue::{Work, WorkQueueEngine};

/// Result of an admin `plug`/`unplug` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminResult {
    Success,
    /// Reserved for host dispatchers that route an unrecognized admin
    /// command through this same result type; `plug`/`unplug` themselves
    /// never produce it.
    Unknown,
}

/// Snapshot of one live disk, as returned by `info()`.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub index: usize,
    pub path: PathBuf,
    pub total_space: u64,
    pub used_space: u64,
}

struct PlacementState {
    disks: Vec<Disk>,
    ring: Vec<VDisk>,
}

/// The multi-disk placement layer. One process-wide `RwLock` guards the
/// disk array and its ring together, so the ring is never observed out of
/// sync with the disks that produced it.
pub struct MultiDiskPlacement {
    state: RwLock<PlacementState>,
    config: MdConfig,
    recovery_queue: Arc<crate::workqueue::WorkQueue>,
    recovery: Arc<dyn RecoveryOrchestrator>,
    epoch: AtomicU64,
}

impl MultiDiskPlacement {
    /// Build an (initially disk-less) placement layer with its own
    /// dedicated recovery queue on `engine`. Disks are brought in with
    /// `plug`.
    pub fn new(
        config: MdConfig,
        engine: &Arc<WorkQueueEngine>,
        recovery: Arc<dyn RecoveryOrchestrator>,
    ) -> Result<Arc<MultiDiskPlacement>> {
        let recovery_queue = engine
            .ordered_queue(config.md_wqueue.clone())
            .context("failed to create the MDP recovery queue")?;
        Ok(Arc::new(MultiDiskPlacement {
            state: RwLock::new(PlacementState {
                disks: Vec::new(),
                ring: Vec::new(),
            }),
            config,
            recovery_queue,
            recovery,
            epoch: AtomicU64::new(0),
        }))
    }

    /// `path_for_oid(oid)`: ring lookup only, no filesystem access.
    pub fn path_for_oid(&self, oid: u64) -> Result<PathBuf, MdError> {
        if !self.config.enable_md {
            return Ok(self.config.obj_path.join(disk::object_file_name(oid)));
        }
        let state = self.state.read().unwrap();
        canonical_path(&state, oid).ok_or(MdError::Eio)
    }

    /// `exists(oid)`: canonical path first, then scan-and-repair.
    pub fn exists(&self, oid: u64) -> Result<PathBuf, MdError> {
        if !self.config.enable_md {
            let p = self.config.obj_path.join(disk::object_file_name(oid));
            return if p.exists() { Ok(p) } else { Err(MdError::NoObj) };
        }
        {
            let state = self.state.read().unwrap();
            if let Some(p) = canonical_path(&state, oid) {
                if p.exists() {
                    return Ok(p);
                }
            }
        }
        self.scan_and_repair(oid)
    }

    /// Scan every disk for a misplaced copy of `oid` and rename it onto
    /// its hash-correct disk. Escalates to the write lock for the whole
    /// pass (design note, §9 of the expanded spec: the source's read-lock
    /// plus mutating rename is racy under strict lock semantics).
    fn scan_and_repair(&self, oid: u64) -> Result<PathBuf, MdError> {
        let mut state = self.state.write().unwrap();
        let h = fnv::hash_oid(oid);
        let target_idx = match ring::locate(&state.ring, h) {
            Some(i) => state.ring[i].idx as usize,
            None => return Err(MdError::Eio),
        };
        let name = disk::object_file_name(oid);
        let canonical = match state.disks.get(target_idx) {
            Some(d) => d.path.join(&name),
            None => return Err(MdError::Eio),
        };
        if canonical.exists() {
            return Ok(canonical);
        }
        for (idx, d) in state.disks.iter().enumerate() {
            if idx == target_idx {
                continue;
            }
            let candidate = d.path.join(&name);
            if !candidate.exists() {
                continue;
            }
            match fs::rename(&candidate, &canonical) {
                Ok(()) => {
                    log::info!(
                        "scan-and-repair: relocated {:016x} from {} to {}",
                        oid,
                        candidate.display(),
                        canonical.display()
                    );
                    return Ok(canonical);
                }
                Err(e) => {
                    log::warn!(
                        "scan-and-repair: failed to relocate {:016x} from {}: {}",
                        oid,
                        candidate.display(),
                        e
                    );
                }
            }
        }
        Err(MdError::NoObj)
    }

    /// `stale_path(oid, epoch)`: scan `.stale/` on every disk for a prior
    /// snapshot. Read-only, so this stays under the read lock (unlike
    /// `exists`'s scan-and-repair, nothing here mutates the filesystem).
    pub fn stale_path(&self, oid: u64, epoch: u32) -> Result<PathBuf, MdError> {
        if epoch == 0 || !self.config.enable_md {
            return Err(MdError::NoObj);
        }
        let state = self.state.read().unwrap();
        let name = disk::stale_file_name(oid, epoch);
        for d in state.disks.iter() {
            let candidate = disk::stale_dir(&d.path).join(&name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(MdError::NoObj)
    }

    /// `for_each_object(f, cleanup)`: iterate every disk path in
    /// registration order (or the legacy single path when MDP is
    /// disabled), stopping at the first non-success status `f` returns.
    pub fn for_each_object<F>(&self, cleanup: bool, mut f: F) -> Result<(), MdError>
    where
        F: FnMut(u64, &Path) -> Result<(), MdError>,
    {
        if !self.config.enable_md {
            return iterate_dir(&self.config.obj_path, cleanup, &mut f);
        }
        let state = self.state.read().unwrap();
        for d in state.disks.iter() {
            iterate_dir(&d.path, cleanup, &mut f)?;
        }
        Ok(())
    }

    /// `handle_eio(faulty_path)`: enqueue asynchronous recovery and ask
    /// the caller to retry.
    pub fn handle_eio(self: &Arc<Self>, faulty_path: &Path) -> MdError {
        if !self.config.enable_md {
            return MdError::Eio;
        }
        {
            let mut state = self.state.write().unwrap();
            if state.disks.is_empty() {
                return MdError::Eio;
            }
            // The last Active disk cannot transition out of Active (spec
            // §4.2 state machine); everything else moving toward removal
            // is marked PendingRemoval for the async gap until do_recover
            // runs.
            if state.disks.len() > 1 {
                if let Some(d) = state.disks.iter_mut().find(|d| d.path == faulty_path) {
                    d.state = DiskState::PendingRemoval;
                }
            }
        }
        let mdp = Arc::clone(self);
        let faulty_path = faulty_path.to_path_buf();
        self.recovery_queue.submit(Work::done_only(Box::new(move || {
            mdp.do_recover(&faulty_path);
        })));
        MdError::NetworkError
    }

    /// Runs on the WQE completion thread as the `done` step of a recovery
    /// work item. Idempotent: a duplicate report for an already-removed
    /// path is silently a no-op.
    fn do_recover(&self, faulty_path: &Path) {
        let mut state = self.state.write().unwrap();
        let Some(pos) = state.disks.iter().position(|d| d.path == faulty_path) else {
            return;
        };
        if state.disks.len() <= 1 {
            log::warn!(
                "handle_eio: {} is the last remaining disk, keeping it as a phantom entry",
                faulty_path.display()
            );
            state.disks[pos].state = DiskState::Active;
            return;
        }
        state.disks[pos].state = DiskState::Removed;
        state.disks.remove(pos);
        self.rebuild_locked(&mut state);
        let remaining = state.disks.len();
        drop(state);
        log::info!("recovered from EIO on {}", faulty_path.display());
        if remaining >= 1 {
            self.kick_recovery();
        }
    }

    /// `plug(paths)`: register each new absolute path, skipping ones
    /// already present. A no-op plug (every path already registered)
    /// reports success without touching the ring.
    pub fn plug(&self, paths: &str) -> Result<AdminResult> {
        let new_paths = split_paths(paths)?;
        let mut state = self.state.write().unwrap();
        let before = state.disks.len();
        for p in new_paths {
            if state.disks.iter().any(|d| d.path == p) {
                continue;
            }
            if let Some(d) = Disk::register(p) {
                state.disks.push(d);
            }
        }
        if state.disks.len() == before {
            return Ok(AdminResult::Success);
        }
        self.rebuild_locked(&mut state);
        drop(state);
        self.kick_recovery();
        Ok(AdminResult::Success)
    }

    /// `unplug(paths)`: remove each path, unless doing so would empty the
    /// disk array entirely -- in which case one disk is kept as the
    /// phantom entry (same invariant `do_recover` enforces).
    pub fn unplug(&self, paths: &str) -> Result<AdminResult> {
        let remove_paths = split_paths(paths)?;
        let mut state = self.state.write().unwrap();
        let before = state.disks.len();

        let survivors_if_removed = state
            .disks
            .iter()
            .filter(|d| !remove_paths.contains(&d.path))
            .count();

        if survivors_if_removed == 0 && before > 0 {
            let keep = state.disks[0].path.clone();
            state.disks.retain(|d| d.path == keep);
        } else {
            for d in state.disks.iter_mut() {
                if remove_paths.contains(&d.path) {
                    d.state = DiskState::Removed;
                }
            }
            state.disks.retain(|d| !remove_paths.contains(&d.path));
        }

        if state.disks.len() == before {
            return Ok(AdminResult::Success);
        }
        self.rebuild_locked(&mut state);
        drop(state);
        self.kick_recovery();
        Ok(AdminResult::Success)
    }

    /// Snapshot of each live disk's lifecycle state, keyed by path. Test-only:
    /// `info()` is the public surface and intentionally doesn't expose
    /// `DiskState` to callers outside this crate.
    #[cfg(test)]
    fn disk_states(&self) -> Vec<(PathBuf, DiskState)> {
        let state = self.state.read().unwrap();
        state.disks.iter().map(|d| (d.path.clone(), d.state)).collect()
    }

    /// `info()`: one snapshot per live disk.
    pub fn info(&self) -> Vec<DiskInfo> {
        let state = self.state.read().unwrap();
        state
            .disks
            .iter()
            .enumerate()
            .map(|(index, d)| DiskInfo {
                index,
                path: d.path.clone(),
                total_space: disk::statvfs_total_bytes(&d.path).unwrap_or(d.free_space),
                used_space: walk_used_bytes(&d.path),
            })
            .collect()
    }

    /// Re-read free space, recompute weights, and rebuild the ring for the
    /// disk set currently held under the write lock.
    ///
    /// `disks` is sorted into canonical (path) order first: `plug`/`unplug`
    /// otherwise leave it in whatever order paths were registered in, and
    /// while `ring::build_ring` itself is already order-independent, keeping
    /// the disk array canonical too makes `info()`'s indices and any future
    /// code that walks `disks` directly agree with the ring's own notion of
    /// order, instead of two separately-safe-but-divergent orderings.
    fn rebuild_locked(&self, state: &mut PlacementState) {
        state.disks.sort_by(|a, b| a.path.cmp(&b.path));
        for d in state.disks.iter_mut() {
            if let Err(e) = d.init_space() {
                log::warn!("failed to refresh free space for {}: {}", d.path.display(), e);
            }
        }
        ring::assign_weights(&mut state.disks);
        state.ring = ring::build_ring(&state.disks);
        log::info!(
            "placement ring rebuilt: {} disks, {} ring points",
            state.disks.len(),
            state.ring.len()
        );
    }

    fn kick_recovery(&self) {
        let view = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.recovery.start_recovery(view, view);
    }
}

fn canonical_path(state: &PlacementState, oid: u64) -> Option<PathBuf> {
    let h = fnv::hash_oid(oid);
    let entry_idx = ring::locate(&state.ring, h)?;
    let target = state.disks.get(state.ring[entry_idx].idx as usize)?;
    Some(target.path.join(disk::object_file_name(oid)))
}

fn walk_used_bytes(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| disk::parse_object_name(n).is_some())
        })
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn iterate_dir<F>(path: &Path, cleanup: bool, f: &mut F) -> Result<(), MdError>
where
    F: FnMut(u64, &Path) -> Result<(), MdError>,
{
    let entries = match fs::read_dir(path) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if name.ends_with(".tmp") {
            if cleanup {
                let _ = fs::remove_file(entry.path());
            }
            continue;
        }
        if let Some(oid) = disk::parse_object_name(name) {
            f(oid, &entry.path())?;
        }
    }
    Ok(())
}

fn split_paths(paths: &str) -> Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    for part in paths.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let p = PathBuf::from(trimmed);
        if !p.is_absolute() {
            anyhow::bail!("admin path must be absolute: {}", trimmed);
        }
        result.push(p);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FixedMembership, NoopEventLoop, NoopTracer, RecoveryOrchestrator};
    use crate::config::WqeConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingRecovery {
        kicks: AtomicUsize,
    }
    impl RecoveryOrchestrator for CountingRecovery {
        fn start_recovery(&self, _old_view: u64, _new_view: u64) {
            self.kicks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_harness() -> (Arc<WorkQueueEngine>, Arc<CountingRecovery>) {
        let engine = WorkQueueEngine::new(
            Duration::from_millis(50),
            Arc::new(FixedMembership(2)),
            Arc::new(NoopTracer),
            &NoopEventLoop,
        );
        let recovery = Arc::new(CountingRecovery {
            kicks: AtomicUsize::new(0),
        });
        (engine, recovery)
    }

    fn config() -> MdConfig {
        MdConfig {
            enable_md: true,
            obj_path: PathBuf::from("/unused"),
            md_wqueue: "test_recovery".to_string(),
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition did not become true in time");
    }

    #[test]
    fn single_disk_initializes_and_resolves_every_oid_to_it() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        if mdp.plug(&dir.path().display().to_string()).is_err() {
            return;
        }
        if mdp.info().is_empty() {
            // xattrs unsupported on this filesystem; init_path dropped the
            // disk, nothing further to assert.
            return;
        }
        for oid in [1u64, 42, 0xdead_beef] {
            let p = mdp.path_for_oid(oid).unwrap();
            assert_eq!(p.parent().unwrap(), dir.path());
        }
    }

    #[test]
    fn two_equal_disks_each_get_placements() {
        let dirs: Vec<TempDir> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        let joined = dirs
            .iter()
            .map(|d| d.path().display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        if mdp.plug(&joined).is_err() {
            return;
        }
        if mdp.info().len() < 2 {
            return;
        }
        let mut hit = [false, false];
        for oid in 0u64..2000 {
            let p = mdp.path_for_oid(oid).unwrap();
            for (i, d) in dirs.iter().enumerate() {
                if p.parent().unwrap() == d.path() {
                    hit[i] = true;
                }
            }
        }
        assert!(hit[0] && hit[1], "both disks should receive placements");
    }

    #[test]
    fn write_exists_misplace_exists_again_round_trip() {
        let dirs: Vec<TempDir> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        let joined = dirs
            .iter()
            .map(|d| d.path().display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        if mdp.plug(&joined).is_err() || mdp.info().len() < 2 {
            return;
        }

        // Find an oid whose canonical disk is dirs[0], write it there.
        let mut oid = None;
        for candidate in 0u64..5000 {
            let p = mdp.path_for_oid(candidate).unwrap();
            if p.parent().unwrap() == dirs[0].path() {
                oid = Some(candidate);
                break;
            }
        }
        let oid = oid.expect("at least one oid should hash to disk 0 within 5000 tries");
        let canonical = mdp.path_for_oid(oid).unwrap();
        fs::write(&canonical, b"payload").unwrap();
        assert_eq!(mdp.exists(oid).unwrap(), canonical);

        // Misplace it onto the other disk and delete the canonical copy.
        let misplaced = dirs[1].path().join(disk::object_file_name(oid));
        fs::rename(&canonical, &misplaced).unwrap();
        assert!(!canonical.exists());

        // exists() should scan, find it, and repair it back onto disk 0.
        let repaired = mdp.exists(oid).unwrap();
        assert_eq!(repaired, canonical);
        assert!(canonical.exists());
        assert!(!misplaced.exists());
    }

    #[test]
    fn eio_on_active_disk_schedules_recovery_and_shrinks_the_ring() {
        let dirs: Vec<TempDir> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let (engine, recovery) = test_harness();
        let recovery_clone = Arc::clone(&recovery);
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery_clone).unwrap();
        let joined = dirs
            .iter()
            .map(|d| d.path().display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        if mdp.plug(&joined).is_err() || mdp.info().len() < 2 {
            return;
        }
        let kicks_before = recovery.kicks.load(Ordering::SeqCst);

        let status = mdp.handle_eio(dirs[0].path());
        assert_eq!(status, MdError::NetworkError);

        wait_for(|| mdp.info().len() == 1);
        assert!(recovery.kicks.load(Ordering::SeqCst) > kicks_before);
    }

    #[test]
    fn eio_on_the_last_disk_keeps_the_phantom_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        if mdp.plug(&dir.path().display().to_string()).is_err() || mdp.info().is_empty() {
            return;
        }

        let status = mdp.handle_eio(dir.path());
        assert_eq!(status, MdError::NetworkError);

        // Give the recovery work item a chance to run; it must not drop
        // the last disk.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(mdp.info().len(), 1);
        // The last Active disk cannot transition to Removed (spec §4.2).
        assert_eq!(mdp.disk_states()[0].1, DiskState::Active);
    }

    #[test]
    fn disk_lifecycle_state_is_wired_through_eio_and_unplug() {
        let dirs: Vec<TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        let joined = dirs
            .iter()
            .map(|d| d.path().display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        if mdp.plug(&joined).is_err() || mdp.info().len() < 3 {
            return;
        }
        assert!(mdp
            .disk_states()
            .iter()
            .all(|(_, s)| *s == DiskState::Active));

        // EIO on an active disk with siblings present: it is gone from the
        // array once recovery drains, never observed lingering as Removed.
        let status = mdp.handle_eio(dirs[0].path());
        assert_eq!(status, MdError::NetworkError);
        wait_for(|| mdp.info().len() == 2);
        assert!(mdp
            .disk_states()
            .iter()
            .all(|(p, s)| p != dirs[0].path() && *s == DiskState::Active));

        // unplug drives the same Active -> Removed transition directly.
        let remaining_path = mdp.disk_states()[0].0.clone();
        assert!(mdp.unplug(&remaining_path.display().to_string()).is_ok());
        assert_eq!(mdp.info().len(), 1);
    }

    #[test]
    fn md_disabled_falls_back_to_the_legacy_single_path() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, recovery) = test_harness();
        let mut cfg = config();
        cfg.enable_md = false;
        cfg.obj_path = dir.path().to_path_buf();
        let mdp = MultiDiskPlacement::new(cfg, &engine, recovery).unwrap();

        let oid = 7u64;
        let p = mdp.path_for_oid(oid).unwrap();
        assert_eq!(p, dir.path().join(disk::object_file_name(oid)));
        assert_eq!(mdp.exists(oid), Err(MdError::NoObj));
        fs::write(&p, b"x").unwrap();
        assert_eq!(mdp.exists(oid).unwrap(), p);
    }

    #[test]
    fn plug_is_a_no_op_when_every_path_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        let path_str = dir.path().display().to_string();
        if mdp.plug(&path_str).is_err() || mdp.info().is_empty() {
            return;
        }
        assert_eq!(mdp.plug(&path_str).unwrap(), AdminResult::Success);
        assert_eq!(mdp.info().len(), 1);
    }

    #[test]
    fn for_each_object_skips_tmp_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, recovery) = test_harness();
        let mdp = MultiDiskPlacement::new(config(), &engine, recovery).unwrap();
        if mdp.plug(&dir.path().display().to_string()).is_err() || mdp.info().is_empty() {
            return;
        }
        fs::write(dir.path().join(disk::object_file_name(1)), b"a").unwrap();
        fs::write(dir.path().join(disk::tmp_file_name(2)), b"b").unwrap();

        let seen = Mutex::new(Vec::new());
        mdp.for_each_object(true, |oid, _path| {
            seen.lock().unwrap().push(oid);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.into_inner().unwrap(), vec![1u64]);
        assert!(!dir.path().join(disk::tmp_file_name(2)).exists());
    }
}
