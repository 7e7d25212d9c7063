//! Per-file metadata held in memory while segments are written and read.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::segment::format::FooterIndexEntry;

#[derive(Default)]
struct Inner {
    filesizes: HashMap<u32, u64>,
    largefiles: HashSet<u32>,
    compactedfiles: HashSet<u32>,
    num_writes_in_progress: HashMap<u32, u32>,
    logindexes: HashMap<u32, Vec<FooterIndexEntry>>,
    has_padding_in_values: HashSet<u32>,
}

/// Tracks the mutable state of every segment file: its current size, its
/// classification flags, the pending footer index, and the in-flight write
/// counter that gates footer writes.
pub struct FileResourceManager {
    inner: Mutex<Inner>,
}

impl FileResourceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Drops all transient per-file state once a file is sealed.
    pub fn reset_file(&self, fileid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.num_writes_in_progress.remove(&fileid);
        inner.logindexes.remove(&fileid);
        inner.has_padding_in_values.remove(&fileid);
    }

    pub fn filesize(&self, fileid: u32) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.filesizes.get(&fileid).copied().unwrap_or(0)
    }

    pub fn set_filesize(&self, fileid: u32, filesize: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.filesizes.insert(fileid, filesize);
    }

    pub fn is_file_large(&self, fileid: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.largefiles.contains(&fileid)
    }

    pub fn set_file_large(&self, fileid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.largefiles.insert(fileid);
    }

    pub fn is_file_compacted(&self, fileid: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.compactedfiles.contains(&fileid)
    }

    pub fn set_file_compacted(&self, fileid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.compactedfiles.insert(fileid);
    }

    pub fn writes_in_progress(&self, fileid: u32) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner
            .num_writes_in_progress
            .get(&fileid)
            .copied()
            .unwrap_or(0)
    }

    /// Adjusts the in-flight write counter and returns the new value.
    ///
    /// The counter exists so that a file which has been flushed but is still
    /// receiving chunks of a multi-chunk entry does not get its footer yet.
    /// If the process crashes mid-entry the file has no footer, which forces
    /// recovery and discovers the incomplete entry.
    pub fn add_writes_in_progress(&self, fileid: u32, delta: i32) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.num_writes_in_progress.entry(fileid).or_insert(0);
        *counter = counter.saturating_add_signed(delta);
        *counter
    }

    pub fn footer_index(&self, fileid: u32) -> Vec<FooterIndexEntry> {
        let inner = self.inner.lock().unwrap();
        inner.logindexes.get(&fileid).cloned().unwrap_or_default()
    }

    pub fn add_footer_index(&self, fileid: u32, entry: FooterIndexEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.logindexes.entry(fileid).or_default().push(entry);
    }

    pub fn has_padding_in_values(&self, fileid: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.has_padding_in_values.contains(&fileid)
    }

    pub fn set_has_padding_in_values(&self, fileid: u32, flag: bool) {
        let mut inner = self.inner.lock().unwrap();
        if flag {
            inner.has_padding_in_values.insert(fileid);
        } else {
            inner.has_padding_in_values.remove(&fileid);
        }
    }
}

impl Default for FileResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_in_progress_counter() {
        let resources = FileResourceManager::new();
        assert_eq!(resources.writes_in_progress(1), 0);
        assert_eq!(resources.add_writes_in_progress(1, 1), 1);
        assert_eq!(resources.add_writes_in_progress(1, 1), 2);
        assert_eq!(resources.add_writes_in_progress(1, -1), 1);
        assert_eq!(resources.add_writes_in_progress(1, -1), 0);
    }

    #[test]
    fn test_reset_clears_transient_state() {
        let resources = FileResourceManager::new();
        resources.set_filesize(3, 1024);
        resources.add_writes_in_progress(3, 1);
        resources.add_footer_index(
            3,
            FooterIndexEntry {
                hashed_key: 9,
                offset_entry: 64,
            },
        );
        resources.set_has_padding_in_values(3, true);

        resources.reset_file(3);
        assert_eq!(resources.writes_in_progress(3), 0);
        assert!(resources.footer_index(3).is_empty());
        assert!(!resources.has_padding_in_values(3));
        // The recorded size survives, readers still need it.
        assert_eq!(resources.filesize(3), 1024);
    }

    #[test]
    fn test_classification_flags() {
        let resources = FileResourceManager::new();
        assert!(!resources.is_file_large(7));
        resources.set_file_large(7);
        assert!(resources.is_file_large(7));

        assert!(!resources.is_file_compacted(7));
        resources.set_file_compacted(7);
        assert!(resources.is_file_compacted(7));
    }
}
