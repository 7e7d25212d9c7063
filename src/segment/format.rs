//! On-disk segment encoding.
//!
//! A segment file has three regions:
//!
//! ```text
//! +----------------------+
//! | Header (64 bytes)    |  file type + timestamp, zero padded
//! +----------------------+
//! | Entry 1              |
//! | Entry 2              |
//! | ...                  |
//! +----------------------+
//! | Footer index         |  (hash, offset) pair per entry, 12 bytes each
//! | Footer (30 bytes)    |  region offset, entry count, magic, crc32
//! +----------------------+
//! ```
//!
//! An entry is `header ‖ key ‖ value`. The first 4 bytes of the entry header
//! are its CRC32C so they can be excluded from the checksum input: the stored
//! value is `crc32c(header[4..])` combined with the caller's running CRC32C
//! over `key ‖ value`, which lets the header be rewritten once the compressed
//! size is finalized without re-scanning the payload.
//!
//! All fixed-width integers are little-endian. Sizes are LEB128 varints; the
//! compressed-size field is padded to the byte width of the value-size field
//! so a last-chunk header rewrite never changes the header length.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::{errdata, errinput};

/// Fixed size of the segment file header region.
pub const SEGMENT_HEADER_SIZE: u64 = 64;

/// Footer magic number ("WOEM" read as a little-endian u32, kept as u64).
pub const MAGIC_NUMBER: u64 = 0x4D45_4F57;

/// Fixed encoded size of [`Footer`].
pub const FOOTER_SIZE: u64 = 30;

/// Fixed encoded size of [`FooterIndexEntry`]. This must never change: the
/// footer index is walked as a flat array of entries of this size.
pub const FOOTER_INDEX_ENTRY_SIZE: u64 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    UncompactedLog = 1,
    CompactedLog = 2,
    CompactedLarge = 3,
}

impl FileType {
    pub fn is_compacted(self) -> bool {
        matches!(self, FileType::CompactedLog | FileType::CompactedLarge)
    }

    pub fn is_large(self) -> bool {
        matches!(self, FileType::CompactedLarge)
    }
}

impl TryFrom<u8> for FileType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FileType::UncompactedLog),
            2 => Ok(FileType::CompactedLog),
            3 => Ok(FileType::CompactedLarge),
            n => Err(errdata!("unknown segment file type {n}")),
        }
    }
}

// Varint encoding (LEB128).

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Writes `value` as a LEB128 varint padded with continuation groups to
/// exactly `width` bytes. `value` must fit in `width` groups.
pub fn write_varint_padded(buf: &mut Vec<u8>, value: u64, width: usize) {
    debug_assert!(varint_len(value) <= width, "value too wide for padded varint");
    let mut value = value;
    for i in 0..width {
        let group = value as u8 & 0x7F;
        value >>= 7;
        if i + 1 < width {
            buf.push(group | 0x80);
        } else {
            buf.push(group);
        }
    }
}

/// Reads a LEB128 varint, returning the value and the bytes consumed.
/// Padded encodings decode to the same value as their canonical form.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(10) {
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(errdata!("varint truncated or too long"))
}

/// Segment file header: file type tag and creation timestamp, zero padded to
/// [`SEGMENT_HEADER_SIZE`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentHeader {
    pub filetype: FileType,
    pub timestamp: u64,
}

impl SegmentHeader {
    pub fn new(filetype: FileType, timestamp: u64) -> Self {
        Self {
            filetype,
            timestamp,
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        buf[0] = self.filetype as u8;
        buf[1..9].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_SIZE as usize {
            return Err(errdata!("segment header truncated"));
        }
        let filetype = FileType::try_from(data[0])?;
        let timestamp = u64::from_le_bytes(data[1..9].try_into().unwrap());
        Ok(Self {
            filetype,
            timestamp,
        })
    }
}

// Entry flag bits.
pub const ENTRY_TYPE_PUT: u8 = 0x01;
pub const ENTRY_TYPE_REMOVE: u8 = 0x02;
const ENTRY_TYPE_MASK: u8 = 0x03;
pub const ENTRY_KIND_FULL: u8 = 0x04;
const ENTRY_KIND_MASK: u8 = 0x0C;
pub const ENTRY_HAS_PADDING: u8 = 0x10;

/// Per-entry header: `crc32:u32 | flags:u8 | size_key:varint |
/// size_value:varint | size_value_compressed:padded varint | hash:u64`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntryHeader {
    pub crc32: u32,
    pub flags: u8,
    pub size_key: u32,
    pub size_value: u64,
    pub size_value_compressed: u64,
    pub hash: u64,
}

impl EntryHeader {
    pub fn put(size_key: u32, size_value: u64, size_value_compressed: u64, hash: u64) -> Self {
        Self {
            crc32: 0,
            flags: ENTRY_TYPE_PUT | ENTRY_KIND_FULL,
            size_key,
            size_value,
            size_value_compressed,
            hash,
        }
    }

    pub fn remove(size_key: u32, hash: u64) -> Self {
        Self {
            crc32: 0,
            flags: ENTRY_TYPE_REMOVE | ENTRY_KIND_FULL,
            size_key,
            size_value: 0,
            size_value_compressed: 0,
            hash,
        }
    }

    pub fn is_put(&self) -> bool {
        self.flags & ENTRY_TYPE_MASK == ENTRY_TYPE_PUT
    }

    pub fn is_remove(&self) -> bool {
        self.flags & ENTRY_TYPE_MASK == ENTRY_TYPE_REMOVE
    }

    /// Only Full entries are supported on read; the other kind bits are
    /// reserved.
    pub fn is_full(&self) -> bool {
        self.flags & ENTRY_KIND_MASK == ENTRY_KIND_FULL
    }

    pub fn has_padding(&self) -> bool {
        self.flags & ENTRY_HAS_PADDING != 0
    }

    pub fn set_has_padding(&mut self, padding: bool) {
        if padding {
            self.flags |= ENTRY_HAS_PADDING;
        } else {
            self.flags &= !ENTRY_HAS_PADDING;
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.size_value_compressed > 0
    }

    /// Bytes of value payload that carry data.
    pub fn size_value_used(&self) -> u64 {
        if self.is_compressed() {
            self.size_value_compressed
        } else {
            self.size_value
        }
    }

    /// Bytes the value region occupies on disk: the declared size when the
    /// entry is padded, the used size otherwise.
    pub fn size_value_offset(&self) -> u64 {
        if self.has_padding() {
            self.size_value
        } else {
            self.size_value_used()
        }
    }

    pub fn encoded_len(&self) -> usize {
        // crc32 + flags + size_key + size_value + padded compressed + hash
        4 + 1
            + varint_len(self.size_key as u64)
            + varint_len(self.size_value)
            + varint_len(self.size_value)
            + 8
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
        buf.push(self.flags);
        write_varint(&mut buf, self.size_key as u64);
        write_varint(&mut buf, self.size_value);
        // The compressed size is finalized only at the last chunk; padding it
        // to the width of size_value keeps the rewrite length-stable.
        write_varint_padded(&mut buf, self.size_value_compressed, varint_len(self.size_value));
        buf.extend_from_slice(&self.hash.to_le_bytes());
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf
    }

    /// Decodes an entry header, returning it and the bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 5 {
            return Err(errdata!("entry header truncated"));
        }
        let crc32 = u32::from_le_bytes(data[..4].try_into().unwrap());
        let flags = data[4];
        let type_bits = flags & ENTRY_TYPE_MASK;
        if type_bits == 0
            || type_bits == ENTRY_TYPE_MASK
            || flags & !(ENTRY_TYPE_MASK | ENTRY_KIND_MASK | ENTRY_HAS_PADDING) != 0
        {
            return Err(errdata!("invalid entry flags {flags:#04x}"));
        }
        let mut offset = 5;
        let (size_key, n) = read_varint(&data[offset..])?;
        offset += n;
        let (size_value, n) = read_varint(&data[offset..])?;
        offset += n;
        let (size_value_compressed, n) = read_varint(&data[offset..])?;
        offset += n;
        if data.len() < offset + 8 {
            return Err(errdata!("entry header truncated"));
        }
        let hash = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
        offset += 8;
        if size_key > u32::MAX as u64 {
            return Err(errinput!("key size {size_key} exceeds u32 range"));
        }
        Ok((
            Self {
                crc32,
                flags,
                size_key: size_key as u32,
                size_value,
                size_value_compressed,
                hash,
            },
            offset,
        ))
    }
}

/// The CRC32C stored in an entry header: the header bytes after the CRC
/// field, combined with the payload CRC over `size_key + size_value_used`
/// bytes of key ‖ value.
pub fn entry_checksum(header_bytes: &[u8], payload_crc: u32, payload_len: u64) -> u32 {
    let header_crc = crc32c::crc32c(&header_bytes[4..]);
    crc32c::crc32c_combine(header_crc, payload_crc, payload_len as usize)
}

/// One footer-index record, mapping a hashed key to its entry offset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FooterIndexEntry {
    pub hashed_key: u64,
    pub offset_entry: u32,
}

impl FooterIndexEntry {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.hashed_key.to_le_bytes());
        buf.extend_from_slice(&self.offset_entry.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_INDEX_ENTRY_SIZE as usize {
            return Err(errdata!("footer index entry truncated"));
        }
        Ok(Self {
            hashed_key: u64::from_le_bytes(data[..8].try_into().unwrap()),
            offset_entry: u32::from_le_bytes(data[8..12].try_into().unwrap()),
        })
    }
}

// Footer flag bits.
pub const FOOTER_HAS_PADDING_IN_VALUES: u8 = 0x01;
pub const FOOTER_HAS_INVALID_ENTRIES: u8 = 0x02;
pub const FOOTER_IS_LARGE: u8 = 0x04;
pub const FOOTER_IS_COMPACTED: u8 = 0x08;

/// Fixed trailing record of a segment file. `crc32` covers the footer region
/// from `offset_indexes` up to, but not including, the CRC field itself.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Footer {
    pub filetype: FileType,
    pub flags: u8,
    pub offset_indexes: u64,
    pub num_entries: u64,
    pub magic_number: u64,
    pub crc32: u32,
}

impl Footer {
    pub fn has_padding_in_values(&self) -> bool {
        self.flags & FOOTER_HAS_PADDING_IN_VALUES != 0
    }

    pub fn has_invalid_entries(&self) -> bool {
        self.flags & FOOTER_HAS_INVALID_ENTRIES != 0
    }

    pub fn is_large(&self) -> bool {
        self.flags & FOOTER_IS_LARGE != 0
    }

    pub fn is_compacted(&self) -> bool {
        self.flags & FOOTER_IS_COMPACTED != 0
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut buf = [0u8; FOOTER_SIZE as usize];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u8(self.filetype as u8).unwrap();
        cursor.write_u8(self.flags).unwrap();
        cursor.write_u64::<LittleEndian>(self.offset_indexes).unwrap();
        cursor.write_u64::<LittleEndian>(self.num_entries).unwrap();
        cursor.write_u64::<LittleEndian>(self.magic_number).unwrap();
        cursor.write_u32::<LittleEndian>(self.crc32).unwrap();
        buf
    }

    /// Decodes the fixed footer. The magic number and CRC are not validated
    /// here: callers distinguish a missing footer from a corrupt one.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE as usize {
            return Err(errdata!("footer truncated"));
        }
        let mut cursor = Cursor::new(data);
        let filetype = FileType::try_from(cursor.read_u8()?)?;
        let flags = cursor.read_u8()?;
        let offset_indexes = cursor.read_u64::<LittleEndian>()?;
        let num_entries = cursor.read_u64::<LittleEndian>()?;
        let magic_number = cursor.read_u64::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            filetype,
            flags,
            offset_indexes,
            num_entries,
            magic_number,
            crc32,
        })
    }
}

/// Encodes the complete footer region: the packed index entries followed by
/// the fixed footer, with the trailing CRC32C computed over everything up to
/// the CRC field.
pub fn encode_footer_region(
    logindex: &[FooterIndexEntry],
    filetype: FileType,
    offset_indexes: u64,
    has_padding_in_values: bool,
    has_invalid_entries: bool,
) -> Vec<u8> {
    let mut flags = 0u8;
    if has_padding_in_values {
        flags |= FOOTER_HAS_PADDING_IN_VALUES;
    }
    if has_invalid_entries {
        flags |= FOOTER_HAS_INVALID_ENTRIES;
    }
    if filetype.is_large() {
        flags |= FOOTER_IS_LARGE;
    }
    if filetype.is_compacted() {
        flags |= FOOTER_IS_COMPACTED;
    }

    let mut buf =
        Vec::with_capacity(logindex.len() * FOOTER_INDEX_ENTRY_SIZE as usize + FOOTER_SIZE as usize);
    for entry in logindex {
        entry.encode_into(&mut buf);
    }
    let footer = Footer {
        filetype,
        flags,
        offset_indexes,
        num_entries: logindex.len() as u64,
        magic_number: MAGIC_NUMBER,
        crc32: 0,
    };
    buf.extend_from_slice(&footer.encode());

    let crc_offset = buf.len() - 4;
    let crc32 = crc32c::crc32c(&buf[..crc_offset]);
    buf[crc_offset..].copy_from_slice(&crc32.to_le_bytes());
    buf
}
