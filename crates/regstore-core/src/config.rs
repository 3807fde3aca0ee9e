//! Configuration management for RegStore
//!
//! Provides presets for production and test deployments and a validator
//! that runs before any file is touched.

use std::time::Duration;

/// Trie heights the path encoder can produce (bits per path).
pub const SUPPORTED_HEIGHTS: [u16; 6] = [8, 16, 32, 64, 128, 256];

/// RegStore configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bits per path; every trie in the forest has this height
    pub trie_height: u16,
    /// Maximum number of tries held by the forest before LRU eviction
    pub forest_capacity: usize,
    /// WAL segment seal threshold (bytes)
    pub segment_size_bytes: u64,
    /// Cadence of the background compactor
    pub checkpoint_interval: Duration,
    /// Maximum size of a register owner, controller or key (bytes)
    pub max_register_part_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl Config {
    /// Execution-node deployment: 256-bit paths, 1000 cached tries.
    pub fn production() -> Self {
        Self {
            trie_height: 256,
            forest_capacity: 1000,
            segment_size_bytes: 32 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(60),
            max_register_part_size: 1024,
            max_value_size: 32 * 1024 * 1024,
        }
    }

    /// Small segments and a fast compactor, for tests.
    pub fn testing() -> Self {
        Self {
            trie_height: 256,
            forest_capacity: 100,
            segment_size_bytes: 32 * 1024,
            checkpoint_interval: Duration::from_millis(5),
            max_register_part_size: 1024,
            max_value_size: 1024 * 1024,
        }
    }

    /// Path width in bytes.
    pub fn path_bytes(&self) -> usize {
        self.trie_height as usize / 8
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if !SUPPORTED_HEIGHTS.contains(&self.trie_height) {
            return Err(format!(
                "trie_height must be one of {:?}, got {}",
                SUPPORTED_HEIGHTS, self.trie_height
            ));
        }
        if self.forest_capacity == 0 {
            return Err("forest_capacity must be > 0".into());
        }
        if self.segment_size_bytes < 1024 {
            return Err("segment_size_bytes must be >= 1KB".into());
        }
        if self.checkpoint_interval.is_zero() {
            return Err("checkpoint_interval must be > 0".into());
        }
        if self.max_register_part_size == 0 || self.max_register_part_size > 64 * 1024 {
            return Err("max_register_part_size must be in [1, 64KB]".into());
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return Err("max_value_size must be in [1, 128MB]".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::production() }
}
