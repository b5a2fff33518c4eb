//! Store configuration
//!
//! Everything that used to be ambient process state in storage engines
//! of this shape (instance limits, durability toggles) is explicit
//! startup configuration, validated once at open.

use std::path::PathBuf;

use crate::store::{StorageError, StorageResult};

/// Default cap on concurrently open store instances per process.
pub const DEFAULT_MAX_INSTANCES: usize = 1024;

/// Configuration for opening an [`crate::store::IndexingStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the store's log file; created if absent.
    pub path: PathBuf,
    /// Fsync the log on every commit. Disable only for tests that
    /// accept losing the tail on power failure.
    pub durable_fsync: bool,
    /// Cap on concurrently open store instances in this process.
    pub max_instances: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> StoreConfig {
        StoreConfig {
            path: path.into(),
            durable_fsync: true,
            max_instances: DEFAULT_MAX_INSTANCES,
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfig("store path is empty".into()));
        }
        if self.max_instances == 0 {
            return Err(StorageError::InvalidConfig(
                "max_instances must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(StoreConfig::new("/tmp/quillstore-test").validate().is_ok());
    }

    #[test]
    fn empty_path_is_rejected() {
        let config = StoreConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_instance_limit_is_rejected() {
        let mut config = StoreConfig::new("/tmp/quillstore-test");
        config.max_instances = 0;
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidConfig(_))
        ));
    }
}
