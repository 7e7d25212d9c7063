//! The in-memory index: a multimap from hashed key to entry locations.

use std::collections::HashMap;

use crate::order::Location;

/// Multimap `hash(key) -> locations`. Several locations may share a hash
/// (overwrites of the same key, or collisions); insertion order is preserved
/// per bucket so lookups can walk newest-first.
#[derive(Default)]
pub struct HashIndex {
    buckets: HashMap<u64, Vec<Location>>,
    num_locations: usize,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hash: u64, location: Location) {
        self.buckets.entry(hash).or_default().push(location);
        self.num_locations += 1;
    }

    /// All locations recorded for a hash, oldest first. Empty if none.
    pub fn get(&self, hash: u64) -> &[Location] {
        self.buckets.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removes and returns a whole bucket.
    pub fn take_bucket(&mut self, hash: u64) -> Vec<Location> {
        let bucket = self.buckets.remove(&hash).unwrap_or_default();
        self.num_locations -= bucket.len();
        bucket
    }

    pub fn buckets(&self) -> impl Iterator<Item = (u64, &[Location])> {
        self.buckets.iter().map(|(&h, locs)| (h, locs.as_slice()))
    }

    /// Total number of recorded locations across all buckets.
    pub fn len(&self) -> usize {
        self.num_locations
    }

    pub fn is_empty(&self) -> bool {
        self.num_locations == 0
    }

    /// Moves every location out, leaving the index empty.
    pub fn drain(&mut self) -> Vec<(u64, Vec<Location>)> {
        self.num_locations = 0;
        self.buckets.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_preserved_per_bucket() {
        let mut index = HashIndex::new();
        index.insert(7, Location::new(1, 64));
        index.insert(7, Location::new(2, 64));
        index.insert(7, Location::new(2, 128));

        let bucket = index.get(7);
        assert_eq!(
            bucket,
            &[
                Location::new(1, 64),
                Location::new(2, 64),
                Location::new(2, 128)
            ]
        );
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_missing_hash_is_empty() {
        let index = HashIndex::new();
        assert!(index.get(42).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_take_bucket() {
        let mut index = HashIndex::new();
        index.insert(1, Location::new(1, 64));
        index.insert(2, Location::new(1, 128));

        let bucket = index.take_bucket(1);
        assert_eq!(bucket, vec![Location::new(1, 64)]);
        assert!(index.get(1).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_drain_empties_index() {
        let mut index = HashIndex::new();
        index.insert(1, Location::new(1, 64));
        index.insert(1, Location::new(1, 128));

        let drained = index.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.len(), 2);
        assert!(index.is_empty());
    }
}
