//! Startup recovery: rebuild the in-memory index from segment footers, and
//! salvage entry-by-entry whatever files lost theirs.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::Path;

use tracing::{info, warn};

use crate::errdata;
use crate::error::{Error, Result};
use crate::order::Location;
use crate::segment::format::{
    EntryHeader, Footer, FooterIndexEntry, SegmentHeader, FOOTER_INDEX_ENTRY_SIZE, FOOTER_SIZE,
    MAGIC_NUMBER, SEGMENT_HEADER_SIZE,
};
use crate::segment::reader::SegmentMmap;
use crate::segment::writer::{fileid_from_filename, segment_filename, LogManager};
use crate::store::index::HashIndex;

pub(crate) struct LoadedFile {
    pub filesize: u64,
    pub is_large: bool,
    pub is_compacted: bool,
}

/// Removes every regular file in `dir` whose name starts with `prefix`. An
/// empty prefix clears the directory of files.
pub(crate) fn remove_files_with_prefix(dir: &Path, prefix: &str) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.metadata()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            fs::remove_file(entry.path())
                .map_err(|e| Error::io("could not remove stale file", e))?;
        }
    }
    Ok(())
}

/// Unlinks the data files named in the locks directory: they were pinned by
/// snapshots that did not survive the restart.
fn remove_locked_files(dir: &Path, locks_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(locks_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(fileid) = fileid_from_filename(&name.to_string_lossy(), "") else {
            continue;
        };
        let filepath = dir.join(segment_filename(fileid));
        if let Err(e) = fs::remove_file(&filepath) {
            warn!(fileid, error = %e, "could not remove snapshot-locked file");
        }
    }
    Ok(())
}

/// Loads a database directory into the index.
///
/// Files are processed in `(timestamp, fileid)` order so that puts and
/// removes apply in write order even after compaction renumbered files:
/// compaction outputs carry the maximum timestamp of their inputs, which
/// sorts them after every file they replaced.
pub(crate) fn load_database(
    log: &mut LogManager,
    index: &mut HashIndex,
    is_read_only: bool,
    fileids_ignore: Option<&HashSet<u32>>,
    fileid_end: u32,
    mut fileids_iterator: Option<&mut Vec<u32>>,
) -> Result<()> {
    let config = log.config().clone();
    let dir = config.dir.as_path();
    let locks_dir = dir.join("locks");

    if !dir.exists() {
        if config.create_if_missing && !is_read_only {
            fs::create_dir_all(dir)
                .map_err(|e| Error::io("could not create database directory", e))?;
        } else {
            return Err(Error::io(
                "database directory does not exist",
                dir.display(),
            ));
        }
    }
    if !dir.is_dir() {
        return Err(Error::io(
            "a file with the database name exists and is not a directory",
            dir.display(),
        ));
    }

    if !is_read_only {
        fs::create_dir_all(&locks_dir)
            .map_err(|e| Error::io("could not create locks directory", e))?;
        remove_files_with_prefix(dir, crate::store::PREFIX_COMPACTION)?;
        remove_locked_files(dir, &locks_dir)?;
        remove_files_with_prefix(&locks_dir, "")?;
    }

    // Order files by "timestamp-fileid" before applying them.
    let mut ordered = BTreeMap::new();
    let mut fileid_max = 0u32;
    let mut timestamp_max = 0u64;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(fileid) = fileid_from_filename(&name, "") else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if let Some(ignore) = fileids_ignore {
            if ignore.contains(&fileid) {
                continue;
            }
        }
        if fileid_end != 0 && fileid > fileid_end {
            continue;
        }
        if metadata.len() <= SEGMENT_HEADER_SIZE {
            continue;
        }
        let segment = match SegmentMmap::open(&entry.path()) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(fileid, error = %e, "could not map segment, skipping");
                continue;
            }
        };
        let header = match SegmentHeader::decode(segment.data()) {
            Ok(header) => header,
            Err(e) => {
                warn!(fileid, error = %e, "segment has an invalid header, skipping");
                continue;
            }
        };
        ordered.insert(format!("{:016X}-{:016X}", header.timestamp, fileid), fileid);
        fileid_max = fileid_max.max(fileid);
        timestamp_max = timestamp_max.max(header.timestamp);
    }

    for &fileid in ordered.values() {
        if let Some(iterator) = fileids_iterator.as_deref_mut() {
            iterator.push(fileid);
        }
        let filepath = log.filepath(fileid);
        let segment = match SegmentMmap::open(&filepath) {
            Ok(segment) => segment,
            Err(_) => continue,
        };
        match load_file(&segment, fileid, index) {
            Ok(loaded) => {
                log.resources.set_filesize(fileid, loaded.filesize);
                if loaded.is_large {
                    log.resources.set_file_large(fileid);
                }
                if loaded.is_compacted {
                    log.resources.set_file_compacted(fileid);
                }
            }
            Err(e) if !is_read_only => {
                warn!(fileid, error = %e, "could not load footer index, entering recovery");
                if let Err(e) = recover_file(segment, fileid, index, log) {
                    warn!(fileid, error = %e, "recovery failed, removing file");
                    if let Err(e) = fs::remove_file(&filepath) {
                        warn!(fileid, error = %e, "could not remove unrecoverable file");
                    }
                }
            }
            Err(_) => {}
        }
    }

    if fileid_max > 0 {
        log.set_sequence_fileid(fileid_max);
        log.set_sequence_timestamp(timestamp_max);
    }
    info!(
        files = ordered.len(),
        entries = index.len(),
        sequence_fileid = fileid_max,
        "database loaded"
    );
    Ok(())
}

/// Loads a segment through its footer: verifies the magic number and the
/// footer CRC, then walks the footer index into the main index.
pub(crate) fn load_file(
    segment: &SegmentMmap,
    fileid: u32,
    index: &mut HashIndex,
) -> Result<LoadedFile> {
    let data = segment.data();
    if (data.len() as u64) < SEGMENT_HEADER_SIZE + FOOTER_SIZE {
        return Err(errdata!("file too small to hold a footer"));
    }
    let footer = Footer::decode(&data[data.len() - FOOTER_SIZE as usize..])?;
    if footer.magic_number != MAGIC_NUMBER {
        return Err(errdata!("invalid footer magic number"));
    }
    let offset_indexes = footer.offset_indexes as usize;
    if offset_indexes + 4 > data.len() {
        return Err(errdata!("footer index offset out of bounds"));
    }
    let crc_computed = crc32c::crc32c(&data[offset_indexes..data.len() - 4]);
    if crc_computed != footer.crc32 {
        return Err(errdata!(
            "footer crc mismatch, stored {:08x} computed {:08x}",
            footer.crc32,
            crc_computed
        ));
    }

    let mut offset = offset_indexes;
    for _ in 0..footer.num_entries {
        let entry = FooterIndexEntry::decode(&data[offset..])?;
        index.insert(entry.hashed_key, Location::new(fileid, entry.offset_entry));
        offset += FOOTER_INDEX_ENTRY_SIZE as usize;
    }

    Ok(LoadedFile {
        filesize: data.len() as u64,
        is_large: footer.is_large(),
        is_compacted: footer.is_compacted(),
    })
}

/// Salvages a segment whose footer is missing or corrupt: walks entries from
/// the header forward verifying each checksum, stops at the first invalid
/// entry, truncates the file there, and appends a fresh footer.
fn recover_file(
    segment: SegmentMmap,
    fileid: u32,
    index: &mut HashIndex,
    log: &LogManager,
) -> Result<()> {
    let data = segment.data();
    let header = SegmentHeader::decode(data)?;
    // A large file holds a single oversize entry; there is no way to rebuild
    // a partial one, so it is discarded.
    if header.filetype.is_large() {
        return Err(errdata!("large files are not recoverable"));
    }

    let mut offset = SEGMENT_HEADER_SIZE as usize;
    let mut logindex = Vec::new();
    let mut has_padding_in_values = false;
    let mut has_invalid_entries = false;

    while offset < data.len() {
        let Ok((entry, size_header)) = EntryHeader::decode(&data[offset..]) else {
            break;
        };
        if entry.size_key == 0 {
            break;
        }
        let end_used =
            offset + size_header + entry.size_key as usize + entry.size_value_used() as usize;
        let end_disk =
            offset + size_header + entry.size_key as usize + entry.size_value_offset() as usize;
        if end_used > data.len() || end_disk > data.len() {
            break;
        }
        // An entry whose stored hash does not match its key bytes is not an
        // entry boundary at all (trailing footer debris, reserved regions);
        // the scan ends there without flagging invalid entries.
        let key = &data[offset + size_header..offset + size_header + entry.size_key as usize];
        if entry.hash != log.config().hasher.hash_key(key) {
            break;
        }

        let crc_computed = crc32c::crc32c(&data[offset + 4..end_used]);
        if crc_computed != entry.crc32 {
            has_invalid_entries = true;
            break;
        }

        if entry.has_padding() {
            has_padding_in_values = true;
        }
        logindex.push(FooterIndexEntry {
            hashed_key: entry.hash,
            offset_entry: offset as u32,
        });
        offset = end_disk;
    }

    if logindex.is_empty() {
        return Err(errdata!("no valid entries salvaged"));
    }

    let path = segment.path().to_path_buf();
    let filetype = header.filetype;
    drop(segment);

    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| Error::io("could not open file for recovery", e))?;
    file.set_len(offset as u64)?;
    let size_footer = LogManager::append_footer(
        &mut file,
        &logindex,
        filetype,
        has_padding_in_values,
        has_invalid_entries,
    )?;
    log.resources
        .set_filesize(fileid, offset as u64 + size_footer);

    info!(
        fileid,
        entries = logindex.len(),
        has_invalid_entries,
        "recovered segment"
    );
    for entry in &logindex {
        index.insert(entry.hashed_key, Location::new(fileid, entry.offset_entry));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::order::Order;
    use crate::segment::format::FileType;
    use crate::segment::resource::FileResourceManager;
    use std::sync::Arc;

    fn write_segments(dir: &Path, orders: &[Order]) -> LogManager {
        let config = EngineConfig::new(dir).segment_size(64 * 1024);
        let mut manager = LogManager::new(
            config,
            "",
            FileType::UncompactedLog,
            Arc::new(FileResourceManager::new()),
            false,
        );
        manager
            .write_orders_and_flush(orders)
            .expect("Failed to write orders");
        manager.close().expect("Failed to close manager");
        manager
    }

    fn reopen(dir: &Path) -> (LogManager, HashIndex) {
        let config = EngineConfig::new(dir).segment_size(64 * 1024);
        let mut manager = LogManager::new(
            config,
            "",
            FileType::UncompactedLog,
            Arc::new(FileResourceManager::new()),
            false,
        );
        let mut index = HashIndex::new();
        load_database(&mut manager, &mut index, false, None, 0, None)
            .expect("Failed to load database");
        (manager, index)
    }

    #[test]
    fn test_load_database_restores_index_and_sequences() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let writer = write_segments(
            dir.path(),
            &[
                Order::put(1, b"alpha".to_vec(), b"one".to_vec()),
                Order::put(1, b"beta".to_vec(), b"two".to_vec()),
            ],
        );

        let (reopened, index) = reopen(dir.path());
        assert_eq!(index.len(), 2);
        assert_eq!(reopened.sequence_fileid(), writer.sequence_fileid());
    }

    #[test]
    fn test_recovery_rebuilds_truncated_footer() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let writer = write_segments(
            dir.path(),
            &[
                Order::put(1, b"alpha".to_vec(), b"one".to_vec()),
                Order::put(1, b"beta".to_vec(), b"two".to_vec()),
            ],
        );
        let path = writer.filepath(1);

        // Chop the tail of the footer, destroying its CRC.
        let len = std::fs::metadata(&path).expect("Failed to stat").len();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open");
        file.set_len(len - 17).expect("Failed to truncate");
        drop(file);

        let (_, index) = reopen(dir.path());
        assert_eq!(index.len(), 2, "both body entries must be salvaged");

        // The rebuilt footer validates and carries no invalid-entry flag:
        // only the footer itself was damaged.
        let data = std::fs::read(&path).expect("Failed to read");
        let footer = Footer::decode(&data[data.len() - FOOTER_SIZE as usize..])
            .expect("Failed to decode rebuilt footer");
        assert_eq!(footer.magic_number, MAGIC_NUMBER);
        assert_eq!(footer.num_entries, 2);
        assert!(!footer.has_invalid_entries());
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let writer = write_segments(dir.path(), &[Order::put(1, b"k".to_vec(), b"v".to_vec())]);
        let path = writer.filepath(1);
        let len = std::fs::metadata(&path).expect("Failed to stat").len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open")
            .set_len(len - 5)
            .expect("Failed to truncate");

        let (_, first_index) = reopen(dir.path());
        let bytes_after_first = std::fs::read(&path).expect("Failed to read");

        let (_, second_index) = reopen(dir.path());
        let bytes_after_second = std::fs::read(&path).expect("Failed to read");

        assert_eq!(first_index.len(), second_index.len());
        assert_eq!(bytes_after_first, bytes_after_second);
    }

    #[test]
    fn test_corrupt_entry_truncates_tail() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let writer = write_segments(
            dir.path(),
            &[
                Order::put(1, b"first".to_vec(), b"1".to_vec()),
                Order::put(1, b"second".to_vec(), b"2".to_vec()),
                Order::put(1, b"third".to_vec(), b"3".to_vec()),
            ],
        );
        let path = writer.filepath(1);

        // Find the second entry's offset from the footer index, corrupt its
        // stored CRC, then destroy the footer to force an entry scan.
        let data = std::fs::read(&path).expect("Failed to read");
        let footer =
            Footer::decode(&data[data.len() - FOOTER_SIZE as usize..]).expect("decode failed");
        let second = FooterIndexEntry::decode(
            &data[footer.offset_indexes as usize + FOOTER_INDEX_ENTRY_SIZE as usize..],
        )
        .expect("decode failed");

        let mut data = data;
        data[second.offset_entry as usize] ^= 0xFF;
        let body_end = footer.offset_indexes;
        data.truncate(body_end as usize - 3);
        std::fs::write(&path, &data).expect("Failed to rewrite");

        let (_, index) = reopen(dir.path());
        // Entry 1 survives, entries 2 and 3 are discarded.
        assert_eq!(index.len(), 1);

        let data = std::fs::read(&path).expect("Failed to read");
        let footer =
            Footer::decode(&data[data.len() - FOOTER_SIZE as usize..]).expect("decode failed");
        assert_eq!(footer.num_entries, 1);
        assert!(footer.has_invalid_entries());
    }

    #[test]
    fn test_unrecoverable_file_is_removed() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        // A file with a valid name and header but garbage body, and no
        // valid entry at all.
        let path = dir.path().join(segment_filename(1));
        let mut contents = SegmentHeader::new(FileType::UncompactedLog, 1).encode().to_vec();
        contents.extend_from_slice(&[0xAB; 100]);
        std::fs::write(&path, &contents).expect("Failed to write");

        let (_, index) = reopen(dir.path());
        assert!(index.is_empty());
        assert!(!path.exists(), "unrecoverable file must be unlinked");
    }
}
