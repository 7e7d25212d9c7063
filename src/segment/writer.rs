//! The log manager: owns the active segment file and its write buffer, and
//! routes orders into the append-only log.
//!
//! Entries are staged in a raw in-memory buffer indexed by file offset and
//! flushed in one write per batch. Three write paths exist:
//!
//! - self-contained or first-chunk-of-small orders append to the buffer of
//!   the active file,
//! - later chunks of an entry are positioned writes into the byte range
//!   reserved when the first chunk was seen,
//! - entries larger than the segment budget get a dedicated file of their
//!   own, flagged large.
//!
//! A file receives its footer only once its in-flight write counter drops to
//! zero; a file without a footer is treated as corrupt and recovered at the
//! next open.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::config::EngineConfig;
use crate::errdata;
use crate::error::{Error, Result};
use crate::order::{Location, Order, OrderKind};
use crate::segment::format::{
    encode_footer_region, entry_checksum, EntryHeader, FileType, FooterIndexEntry, SegmentHeader,
    SEGMENT_HEADER_SIZE,
};
use crate::segment::resource::FileResourceManager;

/// Formats a fileid as its on-disk file name.
pub fn segment_filename(fileid: u32) -> String {
    format!("{fileid:08X}")
}

/// Parses a segment file name back into a fileid, stripping the given
/// prefix. Returns None for foreign files.
pub fn fileid_from_filename(name: &str, prefix: &str) -> Option<u32> {
    let hex = name.strip_prefix(prefix)?;
    u32::from_str_radix(hex, 16).ok()
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
        .map_err(|e| Error::io("positioned write failed", e))
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file
            .seek_write(&buf[written..], offset + written as u64)
            .map_err(|e| Error::io("positioned write failed", e))?;
        written += n;
    }
    Ok(())
}

type SessionMap<T> = HashMap<u64, HashMap<Vec<u8>, T>>;

pub struct LogManager {
    config: EngineConfig,
    filetype_default: FileType,
    prefix: String,
    dirpath_locks: PathBuf,
    is_read_only: bool,
    is_closed: bool,

    sequence_fileid: u32,
    sequence_timestamp: u64,
    is_locked_sequence_timestamp: bool,

    // Active file state.
    fileid: u32,
    file: Option<File>,
    offset_start: u64,
    offset_end: u64,
    buffer_raw: Vec<u8>,
    buffer_has_items: bool,

    pub resources: Arc<FileResourceManager>,

    // Chunked-write state, keyed by (session, key) so two sessions streaming
    // the same key land in separate entries.
    key_to_location: SessionMap<Location>,
    key_to_headersize: SessionMap<u32>,
}

impl LogManager {
    pub fn new(
        config: EngineConfig,
        prefix: impl Into<String>,
        filetype_default: FileType,
        resources: Arc<FileResourceManager>,
        is_read_only: bool,
    ) -> Self {
        let dirpath_locks = config.dir.join("locks");
        // The buffer is indexed by absolute file offset. Rotation happens
        // once the buffer passes the budget, and a single non-large entry can
        // add at most another budget's worth plus headers.
        let buffer_size = if is_read_only {
            0
        } else {
            (config.segment_size * 2 + 4096) as usize
        };
        Self {
            config,
            filetype_default,
            prefix: prefix.into(),
            dirpath_locks,
            is_read_only,
            is_closed: false,
            sequence_fileid: 0,
            sequence_timestamp: 0,
            is_locked_sequence_timestamp: false,
            fileid: 0,
            file: None,
            offset_start: 0,
            offset_end: 0,
            buffer_raw: vec![0u8; buffer_size],
            buffer_has_items: false,
            resources,
            key_to_location: HashMap::new(),
            key_to_headersize: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn filepath(&self, fileid: u32) -> PathBuf {
        self.config
            .dir
            .join(format!("{}{}", self.prefix, segment_filename(fileid)))
    }

    pub fn lock_filepath(&self, fileid: u32) -> PathBuf {
        self.dirpath_locks.join(segment_filename(fileid))
    }

    // Fileid sequence.

    pub fn sequence_fileid(&self) -> u32 {
        self.sequence_fileid
    }

    pub fn set_sequence_fileid(&mut self, seq: u32) {
        self.sequence_fileid = seq;
    }

    pub fn increment_sequence_fileid(&mut self, inc: u32) -> u32 {
        self.sequence_fileid += inc;
        self.sequence_fileid
    }

    // Timestamp sequence. Compaction locks the timestamp so every output
    // file inherits the maximum timestamp of its inputs.

    pub fn sequence_timestamp(&self) -> u64 {
        self.sequence_timestamp
    }

    pub fn set_sequence_timestamp(&mut self, seq: u64) {
        if !self.is_locked_sequence_timestamp {
            self.sequence_timestamp = seq;
        }
    }

    pub fn increment_sequence_timestamp(&mut self, inc: u64) -> u64 {
        if !self.is_locked_sequence_timestamp {
            self.sequence_timestamp += inc;
        }
        self.sequence_timestamp
    }

    pub fn lock_sequence_timestamp(&mut self, seq: u64) {
        self.is_locked_sequence_timestamp = true;
        self.sequence_timestamp = seq;
    }

    /// Opens a fresh active segment: allocates the next fileid and
    /// timestamp, reserves the header region, and pre-encodes the header
    /// into the raw buffer.
    fn open_new_file(&mut self) -> Result<()> {
        let fileid = self.increment_sequence_fileid(1);
        let timestamp = self.increment_sequence_timestamp(1);
        let filepath = self.filepath(fileid);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&filepath)
            .map_err(|e| Error::io(format!("could not open segment {}", filepath.display()), e))?;
        debug!(fileid, timestamp, path = %filepath.display(), "opened new segment");

        self.file = Some(file);
        self.fileid = fileid;
        self.offset_start = 0;
        self.offset_end = SEGMENT_HEADER_SIZE;

        let header = SegmentHeader::new(self.filetype_default, timestamp);
        self.buffer_raw[..SEGMENT_HEADER_SIZE as usize].copy_from_slice(&header.encode());
        Ok(())
    }

    /// Writes the footer of the active file, provided no multi-chunk entry
    /// is still in flight.
    fn write_footer(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        if self.resources.writes_in_progress(self.fileid) > 0 {
            trace!(fileid = self.fileid, "footer deferred, writes in progress");
            return Ok(());
        }
        let logindex = self.resources.footer_index(self.fileid);
        let has_padding = self.resources.has_padding_in_values(self.fileid);
        let file = self.file.as_mut().unwrap();
        let size_footer =
            Self::append_footer(file, &logindex, self.filetype_default, has_padding, false)?;
        let filesize = self.resources.filesize(self.fileid);
        self.resources.set_filesize(self.fileid, filesize + size_footer);
        Ok(())
    }

    /// Appends a footer region (index entries + fixed footer + CRC) at the
    /// current end of the file, returning the bytes written.
    pub fn append_footer(
        file: &mut File,
        logindex: &[FooterIndexEntry],
        filetype: FileType,
        has_padding_in_values: bool,
        has_invalid_entries: bool,
    ) -> Result<u64> {
        let position = file.seek(SeekFrom::End(0))?;
        let region = encode_footer_region(
            logindex,
            filetype,
            position,
            has_padding_in_values,
            has_invalid_entries,
        );
        file.write_all(&region)?;
        Ok(region.len() as u64)
    }

    fn close_current_file(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        if self.offset_start == 0 && !self.buffer_has_items {
            // Nothing of this file ever reached disk; drop the empty shell
            // rather than sealing an orphan footer.
            self.file = None;
            let _ = fs::remove_file(self.filepath(self.fileid));
            self.resources.reset_file(self.fileid);
            return Ok(());
        }
        trace!(fileid = self.fileid, "closing segment");
        self.write_footer()?;
        self.file = None;
        self.buffer_has_items = false;
        Ok(())
    }

    /// Flushes buffered bytes to the active file. `padding` reserves that
    /// many additional bytes on disk for a value region whose chunks arrive
    /// later. The file rotates once it reaches the budget, or immediately
    /// when `force_new_file` is set and the body is non-empty.
    pub fn flush_current_file(&mut self, force_new_file: bool, padding: u64) -> Result<u32> {
        if self.file.is_none() {
            return Ok(0);
        }
        let fileid_out = self.fileid;

        if self.buffer_has_items {
            let file = self.file.as_mut().unwrap();
            file.write_all(
                &self.buffer_raw[self.offset_start as usize..self.offset_end as usize],
            )?;
            self.resources.set_filesize(self.fileid, self.offset_end);
            self.offset_start = self.offset_end;
            self.buffer_has_items = false;
        }

        if padding > 0 {
            self.offset_end += padding;
            self.offset_start = self.offset_end;
            self.resources.set_filesize(self.fileid, self.offset_end);
            let file = self.file.as_mut().unwrap();
            file.set_len(self.offset_end)?;
            file.seek(SeekFrom::End(0))?;
        }

        if self.offset_end >= self.config.segment_size
            || (force_new_file && self.offset_end > SEGMENT_HEADER_SIZE)
        {
            self.resources.set_filesize(self.fileid, self.offset_end);
            self.close_current_file()?;
        }
        Ok(fileid_out)
    }

    /// Persists a batch of orders and returns the `(hash, location)` updates
    /// for the index, in submission order. Only completed entries
    /// (self-contained or last chunk) appear in the result.
    pub fn write_orders_and_flush(&mut self, orders: &[Order]) -> Result<Vec<(u64, Location)>> {
        let mut map_index_out = Vec::new();

        for order in orders {
            if self.offset_end > self.config.segment_size {
                self.flush_current_file(true, 0)?;
            }
            if self.file.is_none() {
                self.open_new_file()?;
            }

            let hash = self.config.hasher.hash_key(&order.key);
            let is_large_order =
                order.key.len() as u64 + order.size_value > self.config.segment_size;

            let location = if is_large_order && order.is_first_chunk() {
                Some(self.write_first_chunk_large_order(order, hash)?)
            } else if order.offset_chunk != 0 {
                let location = self
                    .key_to_location
                    .get(&order.session)
                    .and_then(|keys| keys.get(&order.key))
                    .copied();
                match location {
                    Some(location) => {
                        Some(self.write_chunk(order, hash, location, is_large_order)?)
                    }
                    None => {
                        // A chunk without first-chunk state cannot be placed;
                        // dropping it is the only option that does not
                        // corrupt a reserved region of another entry.
                        error!(
                            session = order.session,
                            "dropping chunk with no recorded location"
                        );
                        None
                    }
                }
            } else {
                Some(self.write_first_chunk_or_small_order(order, hash)?)
            };

            if order.is_self_contained() || order.is_last_chunk() {
                if let Some(location) = location {
                    map_index_out.push((hash, location));
                }
                if let Some(keys) = self.key_to_location.get_mut(&order.session) {
                    keys.remove(&order.key);
                }
                if let Some(keys) = self.key_to_headersize.get_mut(&order.session) {
                    keys.remove(&order.key);
                }
            } else if order.is_first_chunk() {
                if let Some(location) = location {
                    if order.kind != OrderKind::Remove {
                        self.key_to_location
                            .entry(order.session)
                            .or_default()
                            .insert(order.key.clone(), location);
                    }
                }
            }
        }

        self.flush_current_file(false, 0)?;
        Ok(map_index_out)
    }

    /// Dedicates a fresh file to an entry larger than the segment budget.
    /// The full value region is reserved up front; later chunks are
    /// positioned writes into it.
    fn write_first_chunk_large_order(&mut self, order: &Order, hash: u64) -> Result<Location> {
        let fileid = self.increment_sequence_fileid(1);
        let timestamp = self.increment_sequence_timestamp(1);
        let filepath = self.filepath(fileid);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&filepath)
            .map_err(|e| {
                Error::io(format!("could not open large segment {}", filepath.display()), e)
            })?;
        trace!(fileid, key_len = order.key.len(), "writing large order");

        file.write_all(&SegmentHeader::new(FileType::CompactedLarge, timestamp).encode())?;

        let mut header = EntryHeader::put(
            order.key.len() as u32,
            order.size_value,
            order.size_value_compressed,
            hash,
        );
        if order.is_self_contained() {
            let encoded = header.encode();
            header.crc32 = entry_checksum(
                &encoded,
                order.crc32,
                order.key.len() as u64 + order.size_value_used(),
            );
        }
        let encoded = header.encode();
        let size_header = encoded.len() as u64;
        file.write_all(&encoded)?;
        file.write_all(&order.key)?;
        file.write_all(&order.chunk)?;

        let reserved = if order.is_self_contained() {
            order.size_value_used()
        } else {
            order.size_value
        };
        let filesize = SEGMENT_HEADER_SIZE + size_header + order.key.len() as u64 + reserved;
        file.set_len(filesize)?;
        self.resources.set_filesize(fileid, filesize);
        self.resources.add_footer_index(
            fileid,
            FooterIndexEntry {
                hashed_key: hash,
                offset_entry: SEGMENT_HEADER_SIZE as u32,
            },
        );

        if order.is_self_contained() {
            let logindex = self.resources.footer_index(fileid);
            let size_footer =
                Self::append_footer(&mut file, &logindex, FileType::CompactedLarge, false, false)?;
            self.resources.set_filesize(fileid, filesize + size_footer);
            self.resources.set_file_large(fileid);
            self.resources.reset_file(fileid);
        } else {
            self.key_to_headersize
                .entry(order.session)
                .or_default()
                .insert(order.key.clone(), size_header as u32);
            self.resources.add_writes_in_progress(fileid, 1);
        }

        Ok(Location::new(fileid, SEGMENT_HEADER_SIZE as u32))
    }

    /// Writes a non-first chunk into the byte range reserved at first-chunk
    /// time. The last chunk rewrites the entry header with the finalized
    /// compressed size and the combined checksum.
    fn write_chunk(
        &mut self,
        order: &Order,
        hash: u64,
        location: Location,
        is_large_order: bool,
    ) -> Result<Location> {
        let fileid = location.fileid();
        let offset_file = location.offset() as u64;
        let filepath = self.filepath(fileid);
        let file = OpenOptions::new().write(true).open(&filepath).map_err(|e| {
            Error::io(format!("could not open segment {}", filepath.display()), e)
        })?;

        let size_header = self
            .key_to_headersize
            .get(&order.session)
            .and_then(|keys| keys.get(&order.key))
            .copied()
            .ok_or_else(|| errdata!("missing header size for chunked write"))?
            as u64;

        write_at(
            &file,
            &order.chunk,
            offset_file + size_header + order.key.len() as u64 + order.offset_chunk,
        )?;

        if order.is_last_chunk() {
            // The header is rewritten to record the finalized compressed size
            // and the combined checksum.
            let mut header = EntryHeader::put(
                order.key.len() as u32,
                order.size_value,
                order.size_value_compressed,
                hash,
            );
            if !is_large_order && header.is_compressed() {
                header.set_has_padding(true);
                self.resources.set_has_padding_in_values(fileid, true);
            }
            let encoded = header.encode();
            header.crc32 = entry_checksum(
                &encoded,
                order.crc32,
                order.key.len() as u64 + header.size_value_used(),
            );
            let encoded = header.encode();
            debug_assert_eq!(
                encoded.len() as u64,
                size_header,
                "entry header length changed on last-chunk rewrite"
            );
            write_at(&file, &encoded, offset_file)?;

            if is_large_order && header.is_compressed() {
                let filesize = SEGMENT_HEADER_SIZE
                    + size_header
                    + order.key.len() as u64
                    + order.size_value_compressed;
                self.resources.set_filesize(fileid, filesize);
                file.set_len(filesize)?;
            }

            let num_writes = self.resources.add_writes_in_progress(fileid, -1);
            let is_active = self.file.is_some() && fileid == self.fileid;
            if !is_active && num_writes == 0 {
                let mut file = file;
                let filetype = if is_large_order {
                    FileType::CompactedLarge
                } else {
                    self.filetype_default
                };
                let logindex = self.resources.footer_index(fileid);
                let has_padding = self.resources.has_padding_in_values(fileid);
                let size_footer =
                    Self::append_footer(&mut file, &logindex, filetype, has_padding, false)?;
                let filesize = self.resources.filesize(fileid);
                self.resources.set_filesize(fileid, filesize + size_footer);
                if is_large_order {
                    self.resources.set_file_large(fileid);
                }
                self.resources.reset_file(fileid);
            }
        }

        Ok(location)
    }

    /// Appends a self-contained entry, the first chunk of a small entry, or
    /// a remove to the active file's buffer.
    fn write_first_chunk_or_small_order(&mut self, order: &Order, hash: u64) -> Result<Location> {
        let location = Location::new(self.fileid, self.offset_end as u32);
        match order.kind {
            OrderKind::Put => {
                let mut header = EntryHeader::put(
                    order.key.len() as u32,
                    order.size_value,
                    order.size_value_compressed,
                    hash,
                );
                header.crc32 = order.crc32;
                if order.is_self_contained() {
                    header.set_has_padding(false);
                    let encoded = header.encode();
                    header.crc32 = entry_checksum(
                        &encoded,
                        order.crc32,
                        order.key.len() as u64 + order.size_value_used(),
                    );
                } else {
                    // The value region will be longer than this first chunk;
                    // the entry stays padded until the last chunk decides.
                    header.set_has_padding(true);
                    self.resources.set_has_padding_in_values(self.fileid, true);
                }
                let encoded = header.encode();
                let size_header = encoded.len();

                let offset = self.offset_end as usize;
                self.buffer_raw[offset..offset + size_header].copy_from_slice(&encoded);
                let key_start = offset + size_header;
                self.buffer_raw[key_start..key_start + order.key.len()]
                    .copy_from_slice(&order.key);
                let chunk_start = key_start + order.key.len();
                self.buffer_raw[chunk_start..chunk_start + order.chunk.len()]
                    .copy_from_slice(&order.chunk);

                self.resources.add_footer_index(
                    self.fileid,
                    FooterIndexEntry {
                        hashed_key: hash,
                        offset_entry: self.offset_end as u32,
                    },
                );
                self.offset_end +=
                    size_header as u64 + order.key.len() as u64 + order.chunk.len() as u64;
                self.buffer_has_items = true;

                if !order.is_self_contained() {
                    self.key_to_headersize
                        .entry(order.session)
                        .or_default()
                        .insert(order.key.clone(), size_header as u32);
                    self.resources.add_writes_in_progress(self.fileid, 1);
                    // Reserve the rest of the value region on disk so later
                    // chunks can be positioned writes into it.
                    self.flush_current_file(false, order.size_value - order.chunk.len() as u64)?;
                }
                Ok(location)
            }
            OrderKind::Remove => {
                let mut header = EntryHeader::remove(order.key.len() as u32, hash);
                let encoded = header.encode();
                header.crc32 =
                    entry_checksum(&encoded, crc32c::crc32c(&order.key), order.key.len() as u64);
                let encoded = header.encode();
                let size_header = encoded.len();

                let offset = self.offset_end as usize;
                self.buffer_raw[offset..offset + size_header].copy_from_slice(&encoded);
                let key_start = offset + size_header;
                self.buffer_raw[key_start..key_start + order.key.len()]
                    .copy_from_slice(&order.key);

                self.resources.add_footer_index(
                    self.fileid,
                    FooterIndexEntry {
                        hashed_key: hash,
                        offset_entry: self.offset_end as u32,
                    },
                );
                self.offset_end += size_header as u64 + order.key.len() as u64;
                self.buffer_has_items = true;
                Ok(location)
            }
        }
    }

    /// Flushes and closes the active file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.is_read_only || self.is_closed {
            return Ok(());
        }
        self.is_closed = true;
        self.flush_current_file(false, 0)?;
        self.close_current_file()
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close log manager");
        }
    }
}
