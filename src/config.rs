use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::hasher::{Crc64Hasher, KeyHasher};

/// Target size of one segment file. An entry larger than this gets a
/// dedicated large file.
pub const DEFAULT_SEGMENT_SIZE: u64 = 256 * 1024;

/// Configuration for the storage engine
#[derive(Clone)]
pub struct EngineConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Segment file budget in bytes (default: 256KB)
    pub segment_size: u64,

    /// Create the database directory if it does not exist (default: true)
    pub create_if_missing: bool,

    /// Marker path polled by the compaction worker. Presence of the file
    /// triggers a full-range compaction. Placeholder trigger contract, see
    /// the compaction worker.
    pub compaction_trigger: PathBuf,

    /// How often the compaction worker polls the trigger (default: 200ms)
    pub compaction_poll_interval: Duration,

    /// Hash function for index keys
    pub hasher: Arc<dyn KeyHasher>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("create_if_missing", &self.create_if_missing)
            .field("compaction_trigger", &self.compaction_trigger)
            .field("compaction_poll_interval", &self.compaction_poll_interval)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            create_if_missing: true,
            compaction_trigger: PathBuf::from("/tmp/do_compaction"),
            compaction_poll_interval: Duration::from_millis(200),
            hasher: Arc::new(Crc64Hasher::new()),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the segment file budget
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set whether to create the database directory if missing
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set the compaction trigger marker path
    pub fn compaction_trigger(mut self, path: impl Into<PathBuf>) -> Self {
        self.compaction_trigger = path.into();
        self
    }

    /// Set the compaction trigger poll interval
    pub fn compaction_poll_interval(mut self, interval: Duration) -> Self {
        self.compaction_poll_interval = interval;
        self
    }

    /// Set the key hash function
    pub fn hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.hasher = hasher;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dir, PathBuf::from("./emberdb"));
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert!(config.create_if_missing);
        assert_eq!(config.compaction_poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/test")
            .segment_size(1024 * 1024)
            .create_if_missing(false)
            .compaction_trigger("/tmp/test_trigger")
            .compaction_poll_interval(Duration::from_millis(50));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.segment_size, 1024 * 1024);
        assert!(!config.create_if_missing);
        assert_eq!(config.compaction_trigger, PathBuf::from("/tmp/test_trigger"));
        assert_eq!(config.compaction_poll_interval, Duration::from_millis(50));
    }
}
