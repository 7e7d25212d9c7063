//! Read-side access to segment files through memory maps.
//!
//! Every lookup materializes the entry from a reference-counted mmap, so a
//! returned [`ValueView`] stays valid after the engine moves on, even if the
//! file is later unlinked (POSIX keeps the mapping alive).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::errdata;
use crate::error::{Error, Result};
use crate::segment::format::EntryHeader;

/// A memory-mapped segment file.
pub struct SegmentMmap {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl SegmentMmap {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::io(format!("could not open segment {}", path.display()), e))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::io(format!("could not mmap segment {}", path.display()), e))?;
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.to_path_buf(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decodes the entry at the given byte offset and returns a view over its
    /// key and value regions. The entry bytes are bounds-checked against the
    /// mapping so a stale index location cannot read past a truncated file.
    pub fn entry_at(&self, offset: u32) -> Result<EntryRef> {
        let offset = offset as usize;
        if offset >= self.mmap.len() {
            return Err(errdata!(
                "entry offset {offset} beyond segment of {} bytes",
                self.mmap.len()
            ));
        }
        let (header, size_header) = EntryHeader::decode(&self.mmap[offset..])?;
        if !header.is_full() {
            // Partial entry kinds are reserved and unsupported on read.
            return Err(Error::io(
                "unsupported entry kind",
                format!("entry at offset {offset} is not a full entry"),
            ));
        }
        let key_offset = offset + size_header;
        let value_offset = key_offset + header.size_key as usize;
        let value_end = value_offset + header.size_value_used() as usize;
        if value_end > self.mmap.len() {
            return Err(errdata!(
                "entry at offset {offset} extends beyond segment of {} bytes",
                self.mmap.len()
            ));
        }
        Ok(EntryRef {
            header,
            mmap: self.mmap.clone(),
            key_offset,
            value_offset,
        })
    }
}

/// A decoded entry backed by the segment's mmap.
pub struct EntryRef {
    pub header: EntryHeader,
    mmap: Arc<Mmap>,
    key_offset: usize,
    value_offset: usize,
}

impl EntryRef {
    pub fn key(&self) -> &[u8] {
        &self.mmap[self.key_offset..self.key_offset + self.header.size_key as usize]
    }

    /// The value bytes that carry data, excluding any padding.
    pub fn value_used(&self) -> &[u8] {
        &self.mmap[self.value_offset..self.value_offset + self.header.size_value_used() as usize]
    }

    /// Detaches an owned, reference-counted view of the value.
    pub fn value_view(&self) -> ValueView {
        ValueView {
            mmap: self.mmap.clone(),
            offset: self.value_offset,
            len: self.header.size_value_used() as usize,
            size_value: self.header.size_value,
            size_value_compressed: self.header.size_value_compressed,
            crc32: self.header.crc32,
        }
    }
}

/// A value returned from a lookup: a slice of a reference-counted mmap plus
/// the size and checksum metadata a decompressing caller needs.
#[derive(Clone, Debug)]
pub struct ValueView {
    mmap: Arc<Mmap>,
    offset: usize,
    len: usize,
    pub size_value: u64,
    pub size_value_compressed: u64,
    pub crc32: u32,
}

impl ValueView {
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[self.offset..self.offset + self.len]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_compressed(&self) -> bool {
        self.size_value_compressed > 0
    }
}

impl AsRef<[u8]> for ValueView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::format::{entry_checksum, SegmentHeader, FileType, SEGMENT_HEADER_SIZE};
    use std::io::Write;

    fn write_test_segment(entries: &[(&[u8], &[u8])]) -> (tempfile::TempDir, PathBuf, Vec<u32>) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("00000001");
        let mut file = File::create(&path).expect("Failed to create segment");

        let mut buf = Vec::new();
        buf.extend_from_slice(&SegmentHeader::new(FileType::UncompactedLog, 1).encode());

        let mut offsets = Vec::new();
        for (key, value) in entries {
            offsets.push(buf.len() as u32);
            let mut header =
                EntryHeader::put(key.len() as u32, value.len() as u64, 0, 42);
            let payload_crc = crc32c::crc32c_append(crc32c::crc32c(key), value);
            header.crc32 = entry_checksum(
                &header.encode(),
                payload_crc,
                (key.len() + value.len()) as u64,
            );
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
        }
        file.write_all(&buf).expect("Failed to write segment");
        file.sync_all().expect("Failed to sync segment");
        (dir, path, offsets)
    }

    #[test]
    fn test_entry_at_returns_key_and_value() {
        let (_dir, path, offsets) =
            write_test_segment(&[(b"alpha", b"one"), (b"beta", b"two")]);
        let segment = SegmentMmap::open(&path).expect("Failed to open segment");

        let entry = segment.entry_at(offsets[0]).expect("Failed to decode entry");
        assert_eq!(entry.key(), b"alpha");
        assert_eq!(entry.value_used(), b"one");

        let entry = segment.entry_at(offsets[1]).expect("Failed to decode entry");
        assert_eq!(entry.key(), b"beta");
        assert_eq!(entry.value_used(), b"two");
    }

    #[test]
    fn test_value_view_outlives_segment_handle() {
        let (_dir, path, offsets) = write_test_segment(&[(b"key", b"value")]);
        let view = {
            let segment = SegmentMmap::open(&path).expect("Failed to open segment");
            let entry = segment.entry_at(offsets[0]).expect("Failed to decode entry");
            entry.value_view()
        };
        // The view holds its own reference to the mapping.
        assert_eq!(view.as_slice(), b"value");
        assert_eq!(view.size_value, 5);
        assert!(!view.is_compressed());
    }

    #[test]
    fn test_entry_at_rejects_out_of_bounds_offset() {
        let (_dir, path, _) = write_test_segment(&[(b"key", b"value")]);
        let segment = SegmentMmap::open(&path).expect("Failed to open segment");
        assert!(segment.entry_at(segment.len() as u32 + 10).is_err());
        // An offset pointing into the middle of the header region decodes
        // garbage or runs out of bounds, but must not panic.
        let _ = segment.entry_at(SEGMENT_HEADER_SIZE as u32 + 2);
    }
}
