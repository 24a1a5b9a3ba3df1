//! Consistent-hash ring construction (spec §3, §4.2).
//!
//! Generalizes a "pick N disks by free space, weighted" candidate
//! selection into "assign each disk a weighted count of ring points, then
//! sort them into a single lookup structure."

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::disk::Disk;
use crate::fnv::Fnv1a;

/// Default weight: a disk with exactly the mean free space across the
/// pool gets this many ring points.
pub const BASE_VDISKS: f64 = 128.0;

/// One ring entry. `id` is the FNV-1a/64 hash of this point; `idx` names
/// the owning `Disk`'s position in the disk array at ring-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VDisk {
    pub id: u64,
    pub idx: u16,
}

/// Recompute `nr_vdisks` for every disk from its `free_space`, proportional
/// to the mean free space across the pool. Round-half-away-from-zero, per
/// spec: `nr_vdisks(d) = round(128 * free_space(d) / mean_free_space)`.
pub fn assign_weights(disks: &mut [Disk]) {
    let n = disks.len();
    if n == 0 {
        return;
    }
    let total_free: u64 = disks.iter().map(|d| d.free_space).sum();
    if total_free == 0 {
        for d in disks.iter_mut() {
            d.nr_vdisks = 0;
        }
        return;
    }
    let mean = total_free as f64 / n as f64;
    for d in disks.iter_mut() {
        let weight = BASE_VDISKS * d.free_space as f64 / mean;
        d.nr_vdisks = round_half_away_from_zero(weight).clamp(0.0, u16::MAX as f64) as u16;
    }
}

fn round_half_away_from_zero(x: f64) -> f64 {
    if x >= 0.0 {
        (x + 0.5).floor()
    } else {
        (x - 0.5).ceil()
    }
}

/// FNV-1a/64 hash for ring point `point_i` of the disk at canonical rank
/// `rank` out of `total_disks`: fold the remaining-disk counter and the
/// point index into the running hash, then fold every byte of the disk's
/// path, in reverse order. This exact byte stream must stay stable so
/// placement decisions survive process restarts. `rank` must be derived
/// from a canonical (path-sorted) ordering, never from a disk's raw
/// position in whatever array the caller happens to hold -- two processes
/// that plug the same paths in a different order must still agree on every
/// vdisk id.
pub fn vdisk_hash(total_disks: usize, rank: usize, point_i: u16, path: &Path) -> u64 {
    let remaining = (total_disks - rank) as u64;
    let mut h = Fnv1a::new();
    h.fold_bytes(&remaining.to_le_bytes());
    h.fold_bytes(&(point_i as u64).to_le_bytes());
    for &b in path.as_os_str().as_bytes().iter().rev() {
        h.fold_byte(b);
    }
    h.finish()
}

/// Rebuild the ring from scratch: one `VDisk` per weighted point, sorted
/// ascending by `id`. Callers must already hold the write lock and must
/// already have called `assign_weights`.
///
/// Hashing ranks disks by a canonical path-sorted order rather than by
/// `disks`'s actual element order, so the resulting ring (and therefore
/// every `path_for_oid` answer) is independent of insertion order for a
/// fixed disk set. `VDisk::idx` still names the disk's position in the
/// `disks` slice as passed in, since that is what callers index with.
pub fn build_ring(disks: &[Disk]) -> Vec<VDisk> {
    let total = disks.len();
    let mut canonical_order: Vec<usize> = (0..total).collect();
    canonical_order.sort_by(|&a, &b| disks[a].path.cmp(&disks[b].path));

    let mut ring = Vec::new();
    for (rank, &orig_idx) in canonical_order.iter().enumerate() {
        let disk = &disks[orig_idx];
        for point in 0..disk.nr_vdisks {
            ring.push(VDisk {
                id: vdisk_hash(total, rank, point, &disk.path),
                idx: orig_idx as u16,
            });
        }
    }
    ring.sort_by_key(|v| v.id);
    ring
}

/// Binary-search the ring for the point owning hash `h`: the first entry
/// with `id >= h`, wrapping to entry 0 if none exists.
pub fn locate(ring: &[VDisk], h: u64) -> Option<usize> {
    if ring.is_empty() {
        return None;
    }
    match ring.binary_search_by_key(&h, |v| v.id) {
        Ok(i) => Some(i),
        Err(i) if i < ring.len() => Some(i),
        Err(_) => Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn disk(path: &str, free_space: u64) -> Disk {
        Disk::for_ring_test(PathBuf::from(path), free_space)
    }

    #[test]
    fn equal_free_space_gives_equal_weight() {
        let mut disks = vec![disk("/a", 1024), disk("/b", 1024)];
        assign_weights(&mut disks);
        assert_eq!(disks[0].nr_vdisks, 128);
        assert_eq!(disks[1].nr_vdisks, 128);
    }

    #[test]
    fn weighted_placement_matches_the_1gib_3gib_example() {
        let gib = 1024u64 * 1024 * 1024;
        let mut disks = vec![disk("/a", gib), disk("/b", 3 * gib)];
        assign_weights(&mut disks);
        assert_eq!(disks[0].nr_vdisks, 64);
        assert_eq!(disks[1].nr_vdisks, 192);
    }

    #[test]
    fn ring_is_sorted_ascending_by_id() {
        let mut disks = vec![disk("/a", 512), disk("/b", 256), disk("/c", 1024)];
        assign_weights(&mut disks);
        let ring = build_ring(&disks);
        let mut sorted = ring.clone();
        sorted.sort_by_key(|v| v.id);
        assert_eq!(ring, sorted);
    }

    #[test]
    fn lookup_wraps_to_entry_zero() {
        let ring = vec![VDisk { id: 10, idx: 0 }, VDisk { id: 20, idx: 1 }];
        assert_eq!(locate(&ring, 25), Some(0));
        assert_eq!(locate(&ring, 15), Some(1));
        assert_eq!(locate(&ring, 5), Some(0));
    }

    #[test]
    fn weight_fidelity_over_1e5_random_oids() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        let gib = 1024u64 * 1024 * 1024;
        let mut disks = vec![disk("/a", gib), disk("/b", 2 * gib), disk("/c", 5 * gib)];
        assign_weights(&mut disks);
        let ring = build_ring(&disks);
        let total_vdisks: u64 = disks.iter().map(|d| d.nr_vdisks as u64).sum();

        let mut rng = StdRng::seed_from_u64(0xD15C_0001);
        const N: u64 = 100_000;
        let mut hits = vec![0u64; disks.len()];
        for _ in 0..N {
            let oid: u64 = rng.gen();
            let h = crate::fnv::hash_oid(oid);
            let entry = locate(&ring, h).expect("non-empty ring");
            hits[ring[entry].idx as usize] += 1;
        }

        const EPSILON: f64 = 0.05;
        for (idx, disk) in disks.iter().enumerate() {
            let expected_fraction = disk.nr_vdisks as f64 / total_vdisks as f64;
            let observed_fraction = hits[idx] as f64 / N as f64;
            assert!(
                (observed_fraction - expected_fraction).abs() < EPSILON,
                "disk {} expected fraction {:.4}, observed {:.4}",
                idx,
                expected_fraction,
                observed_fraction
            );
        }
    }

    #[test]
    fn placement_is_independent_of_insertion_order() {
        let mut a = vec![disk("/x", 100), disk("/y", 200), disk("/z", 300)];
        let mut b = vec![disk("/z", 300), disk("/x", 100), disk("/y", 200)];
        assign_weights(&mut a);
        assign_weights(&mut b);
        // Look up each disk's contribution by path rather than by array
        // index, since the two arrays order disks differently.
        let ring_a = build_ring(&a);
        let ring_b = build_ring(&b);
        let ids_for = |ring: &[VDisk], disks: &[Disk], path: &str| -> std::collections::BTreeSet<u64> {
            let idx = disks.iter().position(|d| d.path == Path::new(path)).unwrap() as u16;
            ring.iter().filter(|v| v.idx == idx).map(|v| v.id).collect()
        };
        for path in ["/x", "/y", "/z"] {
            assert_eq!(ids_for(&ring_a, &a, path), ids_for(&ring_b, &b, path));
        }
    }
}
