//! The storage engine core.
//!
//! # Architecture
//!
//! ```text
//!  callers ──orders──▶ ┌─────────────┐   ┌──────────────┐
//!                      │ data worker │──▶│ index worker │
//!                      └──────┬──────┘   └───────┬──────┘
//!                             ▼                  ▼
//!                      ┌─────────────┐   ┌──────────────┐
//!                      │ segment log │   │  hash index  │◀── Get
//!                      └──────┬──────┘   └──────────────┘
//!                             ▼
//!                      ┌─────────────┐
//!                      │  compactor  │  (background, trigger-driven)
//!                      └─────────────┘
//! ```
//!
//! # Data flow
//!
//! ## Write path
//! 1. Orders are handed to the data worker, which persists them through the
//!    log manager into append-only segment files
//! 2. The resulting `(hash, location)` pairs go to the index worker
//! 3. The index worker merges them into the in-memory hash index
//!
//! ## Read path
//! 1. Hash the key and walk its index bucket newest-first
//! 2. Materialize candidate entries from memory-mapped segments
//! 3. Reject hash collisions by full-key compare; tombstones read as
//!    not-found
//!
//! ## Maintenance
//! - Compaction rewrites the live entries of older segments into compacted
//!   files and drops shadowed versions
//! - Recovery rebuilds the index from segment footers at open, salvaging
//!   entry-by-entry when a footer is missing or corrupt
//! - Snapshots pin obsolete files until released

/// Prefix of in-flight compaction outputs; renamed on completion, purged at
/// startup.
pub(crate) const PREFIX_COMPACTION: &str = "compaction_";

pub(crate) mod compaction;
pub mod engine;
pub mod index;
pub mod recovery;
pub mod snapshot;

pub use engine::StorageEngine;
pub use snapshot::Snapshot;
