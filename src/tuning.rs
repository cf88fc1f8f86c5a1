//! Closed-loop adjustment of the block-size budget.
//!
//! Hits, misses and flushes are counted over a window of events. At the end of
//! each window the miss ratio and flush rate are folded into a pressure value;
//! high pressure shrinks the budget handed to the frontend and low pressure
//! grows it again.

use std::fmt;

pub const WINDOW_SIZE: u64 = 1024;
pub const PRESSURE_LOW: f64 = 0.10;
pub const PRESSURE_HIGH: f64 = 0.40;

pub const BLOCK_SIZE_MIN: usize = 512;
pub const BLOCK_SIZE_MAX: usize = 8192;
pub const BLOCK_SIZE_STEP: usize = 256;
pub const BLOCK_SIZE_DEFAULT: usize = 2048;

pub const PREFETCH_MIN: u32 = 64;
pub const PREFETCH_MAX: u32 = 512;
pub const PREFETCH_STEP: u32 = 64;
pub const PREFETCH_DEFAULT: u32 = 128;

const GENERIC_ARM64_PREFETCH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningEligibility {
    AppleArm64,
    GenericArm64,
    Ineligible,
}

pub fn host_capability() -> TuningEligibility {
    if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
        TuningEligibility::AppleArm64
    } else if cfg!(target_arch = "aarch64") {
        TuningEligibility::GenericArm64
    } else {
        TuningEligibility::Ineligible
    }
}

#[derive(Debug, Clone)]
pub struct TuningState {
    enabled: bool,
    window_hits: u64,
    window_misses: u64,
    window_flushes: u64,
    window_count: u64,
    pressure: f64,
    block_size_limit: usize,
    prefetch_distance: u32,
    total_evictions: u64,
    reuse_saved: u64,
}

impl TuningState {
    pub fn new(eligibility: TuningEligibility) -> Self {
        let (enabled, prefetch_distance) = match eligibility {
            TuningEligibility::AppleArm64 => (true, PREFETCH_DEFAULT),
            TuningEligibility::GenericArm64 => (true, GENERIC_ARM64_PREFETCH),
            TuningEligibility::Ineligible => (false, PREFETCH_DEFAULT),
        };

        match eligibility {
            TuningEligibility::AppleArm64 => log::info!("adaptive cache tuning enabled"),
            TuningEligibility::GenericArm64 => log::info!("basic cache tuning enabled"),
            TuningEligibility::Ineligible => log::debug!("adaptive cache tuning disabled"),
        }

        Self {
            enabled,
            window_hits: 0,
            window_misses: 0,
            window_flushes: 0,
            window_count: 0,
            pressure: 0.0,
            block_size_limit: BLOCK_SIZE_DEFAULT,
            prefetch_distance,
            total_evictions: 0,
            reuse_saved: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn block_size_limit(&self) -> usize {
        self.block_size_limit
    }

    pub fn prefetch_distance(&self) -> u32 {
        self.prefetch_distance
    }

    pub fn total_evictions(&self) -> u64 {
        self.total_evictions
    }

    pub fn reuse_saved(&self) -> u64 {
        self.reuse_saved
    }

    pub fn record_hit(&mut self) {
        if self.enabled {
            self.window_hits += 1;
            self.update();
        }
    }

    pub fn record_miss(&mut self) {
        if self.enabled {
            self.window_misses += 1;
            self.update();
        }
    }

    pub fn record_flush(&mut self) {
        if self.enabled {
            self.window_flushes += 1;
            self.update();
        }
    }

    fn update(&mut self) {
        self.window_count += 1;
        if self.window_count < WINDOW_SIZE {
            return;
        }

        self.apply_pressure(self.compute_pressure());

        self.window_hits = 0;
        self.window_misses = 0;
        self.window_flushes = 0;
        self.window_count = 0;
    }

    /// Pressure of the current window, in `0.0..=1.0`.
    pub fn compute_pressure(&self) -> f64 {
        let total = self.window_hits + self.window_misses;
        if total == 0 {
            return 0.0;
        }

        let miss_ratio = self.window_misses as f64 / total as f64;
        let flush_factor = self.window_flushes as f64 / WINDOW_SIZE as f64 * 0.5;
        (miss_ratio * 0.7 + flush_factor * 0.3).clamp(0.0, 1.0)
    }

    /// Moves the budget and prefetch distance one step according to
    /// `pressure`. Values strictly between the thresholds change nothing.
    pub fn apply_pressure(&mut self, pressure: f64) {
        if !self.enabled {
            return;
        }
        self.pressure = pressure;

        let old_limit = self.block_size_limit;
        if pressure >= PRESSURE_HIGH {
            self.block_size_limit = old_limit
                .saturating_sub(BLOCK_SIZE_STEP)
                .max(BLOCK_SIZE_MIN);
            self.prefetch_distance = (self.prefetch_distance + PREFETCH_STEP).min(PREFETCH_MAX);
        } else if pressure <= PRESSURE_LOW {
            self.block_size_limit = (old_limit + BLOCK_SIZE_STEP).min(BLOCK_SIZE_MAX);
            self.prefetch_distance = self
                .prefetch_distance
                .saturating_sub(PREFETCH_STEP)
                .max(PREFETCH_MIN);
        }

        if self.block_size_limit != old_limit {
            log::info!(
                "cache tuning: pressure {:.2}% -> block budget {} bytes",
                pressure * 100.0,
                self.block_size_limit
            );
        }
    }

    /// Whether a block compiled at `compile_seq` should survive a forced
    /// eviction. Only counts towards the eviction statistics under
    /// non-trivial pressure.
    pub fn should_preserve(&mut self, compile_seq: u64, blocks_compiled: u64) -> bool {
        if !self.enabled || self.pressure < PRESSURE_LOW {
            return false;
        }

        if self.pressure >= PRESSURE_HIGH {
            let age = blocks_compiled.saturating_sub(compile_seq);
            if age < blocks_compiled / 10 {
                self.reuse_saved += 1;
                return true;
            }
        }

        self.total_evictions += 1;
        false
    }
}

impl fmt::Display for TuningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.enabled {
            return write!(f, "Adaptive cache tuning: disabled");
        }

        let window = self.window_hits + self.window_misses;
        let hit_rate = if window == 0 {
            0.0
        } else {
            self.window_hits as f64 / window as f64 * 100.0
        };

        writeln!(f, "=== Adaptive Cache Tuning ===")?;
        writeln!(f, "  Status:               ENABLED")?;
        writeln!(
            f,
            "  Cache Pressure:       {:.2}% ({:.2} = low, {:.2} = high)",
            self.pressure * 100.0,
            PRESSURE_LOW * 100.0,
            PRESSURE_HIGH * 100.0
        )?;
        writeln!(f, "  Window Hits:          {}", self.window_hits)?;
        writeln!(f, "  Window Misses:        {}", self.window_misses)?;
        writeln!(f, "  Window Hit Rate:      {hit_rate:.2}%")?;
        writeln!(f, "  Block Budget:         {} bytes", self.block_size_limit)?;
        writeln!(f, "  Total Evictions:      {}", self.total_evictions)?;
        writeln!(f, "  Blocks Saved:         {}", self.reuse_saved)?;
        if self.total_evictions > 0 {
            let save_rate = self.reuse_saved as f64
                / (self.total_evictions + self.reuse_saved) as f64
                * 100.0;
            writeln!(f, "  Save Rate:            {save_rate:.2}%")?;
        }
        writeln!(f, "  L2 Prefetch Distance: {} bytes", self.prefetch_distance)?;
        write!(f, "=============================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> TuningState {
        TuningState::new(TuningEligibility::AppleArm64)
    }

    #[test]
    fn disabled_is_inert() {
        let mut tuning = TuningState::new(TuningEligibility::Ineligible);
        for _ in 0..3 * WINDOW_SIZE {
            tuning.record_miss();
            tuning.record_flush();
        }
        tuning.apply_pressure(1.0);

        assert!(!tuning.enabled());
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_DEFAULT);
        assert_eq!(tuning.prefetch_distance(), PREFETCH_DEFAULT);
        assert!(!tuning.should_preserve(0, 100));
        assert_eq!(tuning.total_evictions(), 0);
        assert_eq!(tuning.to_string(), "Adaptive cache tuning: disabled");
    }

    #[test]
    fn generic_arm64_starts_with_short_prefetch() {
        let tuning = TuningState::new(TuningEligibility::GenericArm64);
        assert!(tuning.enabled());
        assert_eq!(tuning.prefetch_distance(), 64);
    }

    #[test]
    fn pressure_formula() {
        let mut tuning = enabled();
        assert_eq!(tuning.compute_pressure(), 0.0);

        tuning.window_misses = 10;
        assert!((tuning.compute_pressure() - 0.7).abs() < 1e-9);

        tuning.window_hits = 10;
        tuning.window_flushes = WINDOW_SIZE;
        assert!((tuning.compute_pressure() - (0.35 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn budget_hysteresis() {
        let mut tuning = enabled();

        tuning.apply_pressure(0.5);
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_DEFAULT - BLOCK_SIZE_STEP);
        assert_eq!(tuning.prefetch_distance(), PREFETCH_DEFAULT + PREFETCH_STEP);

        tuning.apply_pressure(0.25);
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_DEFAULT - BLOCK_SIZE_STEP);
        assert_eq!(tuning.prefetch_distance(), PREFETCH_DEFAULT + PREFETCH_STEP);

        tuning.apply_pressure(0.05);
        tuning.apply_pressure(0.10);
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_DEFAULT + BLOCK_SIZE_STEP);
        assert_eq!(tuning.prefetch_distance(), PREFETCH_MIN);
    }

    #[test]
    fn budget_is_clamped() {
        let mut tuning = enabled();
        for _ in 0..100 {
            tuning.apply_pressure(1.0);
        }
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_MIN);
        assert_eq!(tuning.prefetch_distance(), PREFETCH_MAX);

        for _ in 0..100 {
            tuning.apply_pressure(0.0);
        }
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_MAX);
        assert_eq!(tuning.prefetch_distance(), PREFETCH_MIN);
    }

    #[test]
    fn window_of_misses_shrinks_budget() {
        let mut tuning = enabled();
        for _ in 0..WINDOW_SIZE - 1 {
            tuning.record_miss();
        }
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_DEFAULT);

        tuning.record_miss();
        assert_eq!(tuning.block_size_limit(), BLOCK_SIZE_DEFAULT - BLOCK_SIZE_STEP);
        assert!(tuning.pressure() >= PRESSURE_HIGH);
        assert_eq!(tuning.window_count, 0);
    }

    #[test]
    fn preservation_follows_pressure() {
        let mut tuning = enabled();

        tuning.apply_pressure(0.05);
        assert!(!tuning.should_preserve(99, 100));
        assert_eq!(tuning.total_evictions(), 0);

        tuning.apply_pressure(0.2);
        assert!(!tuning.should_preserve(99, 100));
        assert_eq!(tuning.total_evictions(), 1);

        tuning.apply_pressure(0.9);
        assert!(tuning.should_preserve(95, 100));
        assert!(!tuning.should_preserve(50, 100));
        assert_eq!(tuning.reuse_saved(), 1);
        assert_eq!(tuning.total_evictions(), 2);
        assert!(tuning.to_string().contains("Save Rate:"));
    }
}
