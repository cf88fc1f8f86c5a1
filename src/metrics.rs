use std::fmt;

/// Monotonic cache counters. Cleared only by [`CacheMetrics::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
    pub recompiles: u64,
    pub blocks_compiled: u64,
    pub bytes_emitted: u64,
    pub max_block_bytes: u64,
    /// Slots taken from live blocks because nothing else was reclaimable.
    pub forced_evictions: u64,
    /// Eviction-candidate pages flushed to free a slot.
    pub purges: u64,
}

impl CacheMetrics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record_block(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        self.blocks_compiled += 1;
        self.bytes_emitted += bytes;
        self.max_block_bytes = self.max_block_bytes.max(bytes);
    }

    /// Percentage of lookups served from the cache.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }

    pub fn avg_block_bytes(&self) -> f64 {
        if self.blocks_compiled == 0 {
            0.0
        } else {
            self.bytes_emitted as f64 / self.blocks_compiled as f64
        }
    }
}

impl fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cache Metrics Summary ===")?;
        writeln!(f, "  Hits:             {}", self.hits)?;
        writeln!(f, "  Misses:           {}", self.misses)?;
        writeln!(f, "  Hit Ratio:        {:.2}%", self.hit_ratio())?;
        writeln!(f, "  Flushes:          {}", self.flushes)?;
        writeln!(f, "  Recompiles:       {}", self.recompiles)?;
        writeln!(f, "  Blocks Compiled:  {}", self.blocks_compiled)?;
        writeln!(f, "  Bytes Emitted:    {}", self.bytes_emitted)?;
        writeln!(f, "  Avg Block Bytes:  {:.2}", self.avg_block_bytes())?;
        writeln!(f, "  Max Block Bytes:  {}", self.max_block_bytes)?;
        writeln!(f, "  Forced Evictions: {}", self.forced_evictions)?;
        writeln!(f, "  Purges:           {}", self.purges)?;
        write!(f, "=============================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_with_no_activity() {
        let metrics = CacheMetrics::default();
        assert_eq!(metrics.hit_ratio(), 0.0);
        assert_eq!(metrics.avg_block_bytes(), 0.0);
    }

    #[test]
    fn block_sizes() {
        let mut metrics = CacheMetrics::default();
        metrics.record_block(100);
        metrics.record_block(300);
        assert_eq!(metrics.blocks_compiled, 2);
        assert_eq!(metrics.bytes_emitted, 400);
        assert_eq!(metrics.max_block_bytes, 300);
        assert_eq!(metrics.avg_block_bytes(), 200.0);

        metrics.reset();
        assert_eq!(metrics, CacheMetrics::default());
    }

    #[test]
    fn summary_lines() {
        let metrics = CacheMetrics {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        let summary = metrics.to_string();
        assert!(summary.contains("Hit Ratio:        75.00%"));
        assert!(summary.starts_with("=== Cache Metrics Summary ==="));
    }
}
