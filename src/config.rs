//! Scheduler tunables.
//!
//! Defaults match the classic instructional setting; the aging cadence in
//! particular varies between course assignments, so it is a knob rather
//! than a constant.

/// Highest admissible priority; aging saturates here.
pub const PRIORITY_MAX: u32 = 149;

/// Priority at or above which a thread belongs to L1.
pub const L1_PRIORITY_MIN: u32 = 100;

/// Priority at or above which a thread belongs to L2.
pub const L2_PRIORITY_MIN: u32 = 50;

/// Round-robin quantum granted to an L3 thread (ticks).
pub const DEFAULT_QUANTUM_TICKS: u64 = 100;

/// Queue wait after which a thread is aged (ticks).
pub const DEFAULT_AGING_WAIT_TICKS: u64 = 1500;

/// Priority boost applied per aging event.
pub const DEFAULT_AGING_BOOST: u32 = 10;

/// Scheduling parameters, fixed at scheduler construction.
#[derive(Debug, Clone, Copy)]
pub struct SchedConfig {
    /// L3 time quantum in ticks.
    pub quantum_ticks: u64,
    /// Ticks a thread may wait in a ready queue before it is boosted.
    pub aging_wait_ticks: u64,
    /// Priority increment per aging event.
    pub aging_boost: u32,
}

impl SchedConfig {
    pub const fn new() -> Self {
        Self {
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            aging_wait_ticks: DEFAULT_AGING_WAIT_TICKS,
            aging_boost: DEFAULT_AGING_BOOST,
        }
    }

    /// Validate parameters.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.quantum_ticks == 0 {
            return Err("quantum must be at least one tick");
        }
        if self.aging_wait_ticks == 0 {
            return Err("aging wait must be at least one tick");
        }
        if self.aging_boost == 0 {
            return Err("aging boost must be positive");
        }
        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}
