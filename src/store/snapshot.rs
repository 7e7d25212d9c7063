//! Snapshot bookkeeping.
//!
//! A snapshot is a read-only view over the files that existed when it was
//! taken. Compaction makes files obsolete, but an obsolete file pinned by a
//! live snapshot is not unlinked: it is refcounted here and marked with an
//! empty lock file under `locks/`, and the last release unlinks it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::errinput;
use crate::error::Result;

#[derive(Default)]
struct Inner {
    sequence_snapshot: u32,
    snapshot_to_fileids: HashMap<u32, HashSet<u32>>,
    refcounts: HashMap<u32, u32>,
}

pub struct SnapshotRegistry {
    inner: Mutex<Inner>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Allocates a snapshot id and returns it along with the set of fileids
    /// already pinned for deletion, which the snapshot must skip when
    /// iterating: those files are leftovers of an earlier compaction and
    /// their contents are duplicated in the compacted outputs.
    pub fn new_snapshot_data(&self) -> (u32, HashSet<u32>) {
        let mut inner = self.inner.lock().unwrap();
        inner.sequence_snapshot += 1;
        let id = inner.sequence_snapshot;
        inner.snapshot_to_fileids.insert(id, HashSet::new());
        let fileids_ignore = inner.refcounts.keys().copied().collect();
        (id, fileids_ignore)
    }

    pub fn has_live_snapshots(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.snapshot_to_fileids.is_empty()
    }

    pub fn live_snapshot_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        inner.snapshot_to_fileids.keys().copied().collect()
    }

    /// Pins a set of obsolete fileids to every live snapshot. Returns false
    /// when no snapshot is live, in which case the caller may unlink the
    /// files immediately.
    pub fn register_obsolete(&self, fileids: &[u32]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let num_snapshots = inner.snapshot_to_fileids.len() as u32;
        if num_snapshots == 0 {
            return false;
        }
        for fileids_pinned in inner.snapshot_to_fileids.values_mut() {
            fileids_pinned.extend(fileids.iter().copied());
        }
        for &fileid in fileids {
            *inner.refcounts.entry(fileid).or_insert(0) += num_snapshots;
        }
        true
    }

    /// Releases a snapshot, returning the fileids whose last reference this
    /// was: the caller unlinks those files and their lock markers.
    pub fn release(&self, snapshot_id: u32) -> Result<Vec<u32>> {
        let mut inner = self.inner.lock().unwrap();
        let fileids = inner
            .snapshot_to_fileids
            .remove(&snapshot_id)
            .ok_or_else(|| errinput!("no snapshot with id {snapshot_id}"))?;

        let mut to_unlink = Vec::new();
        for fileid in fileids {
            match inner.refcounts.get_mut(&fileid) {
                Some(count) if *count <= 1 => {
                    inner.refcounts.remove(&fileid);
                    to_unlink.push(fileid);
                }
                Some(count) => *count -= 1,
                None => {}
            }
        }
        Ok(to_unlink)
    }

    /// Releases every live snapshot, iterating over a copy of the id list.
    /// Returns all fileids that became unlinkable.
    pub fn release_all(&self) -> Vec<u32> {
        let ids = self.live_snapshot_ids();
        let mut to_unlink = Vec::new();
        for id in ids {
            if let Ok(mut fileids) = self.release(id) {
                to_unlink.append(&mut fileids);
            }
        }
        to_unlink
    }
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot handle returned by the engine. The id ties back to the
/// registry; `fileids_ignore` and `fileid_end` scope a read-only view to the
/// files that existed at creation time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: u32,
    pub fileids_ignore: HashSet<u32>,
    pub fileid_end: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_ids_are_monotonic() {
        let registry = SnapshotRegistry::new();
        let (first, _) = registry.new_snapshot_data();
        let (second, _) = registry.new_snapshot_data();
        assert!(second > first);
    }

    #[test]
    fn test_register_obsolete_without_snapshots_allows_unlink() {
        let registry = SnapshotRegistry::new();
        assert!(!registry.register_obsolete(&[1, 2, 3]));
    }

    #[test]
    fn test_last_release_unlinks() {
        let registry = SnapshotRegistry::new();
        let (first, _) = registry.new_snapshot_data();
        let (second, _) = registry.new_snapshot_data();

        assert!(registry.register_obsolete(&[7, 8]));

        // First release only decrements.
        let unlinked = registry.release(first).expect("release failed");
        assert!(unlinked.is_empty());

        // Second release drops the last references.
        let mut unlinked = registry.release(second).expect("release failed");
        unlinked.sort_unstable();
        assert_eq!(unlinked, vec![7, 8]);
    }

    #[test]
    fn test_release_unknown_snapshot_is_an_error() {
        let registry = SnapshotRegistry::new();
        assert!(registry.release(99).is_err());
    }

    #[test]
    fn test_new_snapshot_sees_pinned_fileids() {
        let registry = SnapshotRegistry::new();
        let (_, ignore) = registry.new_snapshot_data();
        assert!(ignore.is_empty());

        registry.register_obsolete(&[4]);
        let (_, ignore) = registry.new_snapshot_data();
        assert!(ignore.contains(&4));
    }

    #[test]
    fn test_release_all_drains_everything() {
        let registry = SnapshotRegistry::new();
        registry.new_snapshot_data();
        registry.new_snapshot_data();
        registry.register_obsolete(&[1]);

        let unlinked = registry.release_all();
        assert_eq!(unlinked, vec![1]);
        assert!(!registry.has_live_snapshots());
    }
}
