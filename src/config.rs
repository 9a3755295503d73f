//! Engine configuration
//!
//! Tunables for the storage core. The page size is the unit of journaling
//! and recovery; the chain threshold bounds how long a page's journal entry
//! chain may grow before persisted entries are pruned from it.

use std::path::PathBuf;

/// Default page size in bytes (8KB), the journal/recovery unit.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Default bound on a page's journal entry chain before opportunistic
/// pruning of entries whose journal file has already been persisted.
pub const DEFAULT_JOURNAL_CHAIN_THRESHOLD: usize = 35;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory where data and journal files are stored
    pub data_dir: PathBuf,
    /// Page size in bytes
    pub page_size: usize,
    /// Maximum journal entry chain length per page before pruning
    pub journal_chain_threshold: usize,
    /// Open the engine in read-only mode
    pub read_only: bool,
}

impl EngineConfig {
    /// Create a configuration rooted at the given data directory with
    /// default tunables.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
            journal_chain_threshold: DEFAULT_JOURNAL_CHAIN_THRESHOLD,
            read_only: false,
        }
    }

    /// Set the page size
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the journal chain threshold
    pub fn journal_chain_threshold(mut self, threshold: usize) -> Self {
        self.journal_chain_threshold = threshold;
        self
    }

    /// Set read-only mode
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/marrow")
            .page_size(4096)
            .journal_chain_threshold(10);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.journal_chain_threshold, 10);
        assert!(!config.read_only);
    }
}
