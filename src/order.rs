//! Write orders and entry locations.
//!
//! An [`Order`] is the unit submitted by callers: a put or remove, possibly
//! one chunk of a larger value streamed across several submissions. Chunked
//! writes carry a caller-chosen `session` id so that two writers streaming
//! the same key at the same time land in separate entries.

/// Packed entry location: high 32 bits are the fileid, low 32 bits the byte
/// offset of the entry inside that file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(pub u64);

impl Location {
    pub fn new(fileid: u32, offset: u32) -> Self {
        Location((fileid as u64) << 32 | offset as u64)
    }

    pub fn fileid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Rebuilds the location under a different fileid, keeping the offset.
    pub fn with_fileid(self, fileid: u32) -> Self {
        Location::new(fileid, self.offset())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderKind {
    Put,
    Remove,
}

#[derive(Clone, Debug)]
pub struct Order {
    /// Caller-supplied session id keying chunked-write state. Two sessions
    /// streaming the same key concurrently do not collide.
    pub session: u64,
    pub kind: OrderKind,
    pub key: Vec<u8>,
    /// The slice of the value carried by this submission.
    pub chunk: Vec<u8>,
    /// Where in the logical value this chunk starts.
    pub offset_chunk: u64,
    /// Total uncompressed value size.
    pub size_value: u64,
    /// Total compressed value size, 0 when the value is not compressed.
    pub size_value_compressed: u64,
    /// Running CRC32C over key ‖ value bytes, complete once the last chunk
    /// is submitted.
    pub crc32: u32,
}

impl Order {
    /// A self-contained put of a full, uncompressed value.
    pub fn put(session: u64, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        let value = value.into();
        let crc32 = crc32c::crc32c_append(crc32c::crc32c(&key), &value);
        let size_value = value.len() as u64;
        Order {
            session,
            kind: OrderKind::Put,
            key,
            chunk: value,
            offset_chunk: 0,
            size_value,
            size_value_compressed: 0,
            crc32,
        }
    }

    /// A remove order (tombstone) for the given key.
    pub fn remove(session: u64, key: impl Into<Vec<u8>>) -> Self {
        Order {
            session,
            kind: OrderKind::Remove,
            key: key.into(),
            chunk: Vec::new(),
            offset_chunk: 0,
            size_value: 0,
            size_value_compressed: 0,
            crc32: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.size_value_compressed > 0
    }

    /// Bytes the value actually occupies once fully written.
    pub fn size_value_used(&self) -> u64 {
        if self.is_compressed() {
            self.size_value_compressed
        } else {
            self.size_value
        }
    }

    pub fn is_first_chunk(&self) -> bool {
        self.offset_chunk == 0
    }

    pub fn is_last_chunk(&self) -> bool {
        self.offset_chunk + self.chunk.len() as u64 == self.size_value_used()
    }

    /// First and last chunk in a single submission.
    pub fn is_self_contained(&self) -> bool {
        self.is_first_chunk() && self.is_last_chunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_packing() {
        let location = Location::new(0x12, 0x40);
        assert_eq!(location.fileid(), 0x12);
        assert_eq!(location.offset(), 0x40);
        assert_eq!(location.0, 0x12_0000_0040);

        let shifted = location.with_fileid(0x99);
        assert_eq!(shifted.fileid(), 0x99);
        assert_eq!(shifted.offset(), 0x40);
    }

    #[test]
    fn test_self_contained_put() {
        let order = Order::put(1, b"key".to_vec(), b"value".to_vec());
        assert!(order.is_first_chunk());
        assert!(order.is_last_chunk());
        assert!(order.is_self_contained());
        assert!(!order.is_compressed());
        assert_eq!(order.size_value_used(), 5);
    }

    #[test]
    fn test_chunked_order_predicates() {
        let first = Order {
            session: 7,
            kind: OrderKind::Put,
            key: b"key".to_vec(),
            chunk: vec![0u8; 10],
            offset_chunk: 0,
            size_value: 30,
            size_value_compressed: 0,
            crc32: 0,
        };
        assert!(first.is_first_chunk());
        assert!(!first.is_last_chunk());
        assert!(!first.is_self_contained());

        let last = Order {
            offset_chunk: 20,
            ..first.clone()
        };
        assert!(!last.is_first_chunk());
        assert!(last.is_last_chunk());
    }

    #[test]
    fn test_remove_is_self_contained() {
        let order = Order::remove(1, b"key".to_vec());
        assert!(order.is_self_contained());
        assert_eq!(order.size_value_used(), 0);
    }
}
