//! emberdb storage core: an append-only segment log with an in-memory
//! hashed-key index.
//!
//! Writes are serialized into fixed-budget segment files, each closed with a
//! footer that allows the index to be rebuilt without scanning entry bodies.
//! Point lookups materialize values from memory-mapped segments. A
//! background compactor reclaims space held by overwritten and removed
//! entries, and read-only snapshots pin the files they reference until
//! released.

pub mod config;
pub mod error;
pub mod events;
pub mod hasher;
pub mod order;
pub mod segment;
pub mod store;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hasher::{Crc64Hasher, KeyHasher};
pub use order::{Location, Order, OrderKind};
pub use segment::reader::ValueView;
pub use store::{Snapshot, StorageEngine};
