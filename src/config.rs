use crate::dirty;
use crate::error::{CacheError, Result};
use crate::tuning::TuningEligibility;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of block slots.
    pub arena_size: usize,
    /// Invalidated blocks kept for reuse before their slots are freed.
    pub dirty_capacity: usize,
    /// Bytes of executable memory owned by each block.
    pub chunk_size: usize,
    /// Flushes after which a page switches to byte-granular tracking.
    /// `None` keeps every page at page granularity.
    pub byte_mask_threshold: Option<u32>,
    /// Seed for the forced-eviction victim search.
    pub seed: u64,
    /// Overrides the host capability query.
    pub tuning: Option<TuningEligibility>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            arena_size: 1024,
            dirty_capacity: dirty::DEFAULT_CAPACITY,
            chunk_size: 16 * 1024,
            byte_mask_threshold: Some(4),
            seed: 0x5eed,
            tuning: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        // one slot is always pinned by the block last handed out
        if self.arena_size < 2 || self.arena_size > u16::MAX as usize + 1 {
            return Err(CacheError::Config(format!(
                "arena size {} must be within 2..=65536",
                self.arena_size
            )));
        }
        if self.dirty_capacity == 0 {
            return Err(CacheError::Config("dirty capacity must be nonzero".into()));
        }
        if self.chunk_size == 0 {
            return Err(CacheError::Config("chunk size must be nonzero".into()));
        }
        if self.byte_mask_threshold == Some(0) {
            return Err(CacheError::Config(
                "byte mask threshold must be nonzero; use None to disable".into(),
            ));
        }
        Ok(())
    }

    /// Bytes of executable memory needed to give every slot a chunk.
    pub fn code_size(&self) -> usize {
        self.arena_size * self.chunk_size
    }
}
