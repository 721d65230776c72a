//! GPU/CPU clock drift tracking.
//!
//! A queue reports its GPU timestamp together with a CPU tick value sampled
//! at the same instant. The calibrator keeps the CPU ticks of the last
//! accepted sample and turns the forward progress since then into
//! nanoseconds using the process-wide CPU tick frequency.

use crate::hal::ClockSample;

#[derive(Debug, Clone)]
pub struct Calibrator {
    prev_cpu_ticks: u64,
    cpu_ticks_per_second: u64,
}

impl Calibrator {
    /// Seed from the sample taken at context creation. `cpu_ticks_per_second`
    /// must be nonzero; context creation rejects a zero frequency.
    pub fn new(seed: ClockSample, cpu_ticks_per_second: u64) -> Self {
        debug_assert!(cpu_ticks_per_second > 0);
        Self { prev_cpu_ticks: seed.cpu_ticks, cpu_ticks_per_second }
    }

    /// CPU ticks of the last accepted sample.
    pub fn prev_cpu_ticks(&self) -> u64 {
        self.prev_cpu_ticks
    }

    /// Accept `sample` if its CPU ticks moved forward, returning the elapsed
    /// CPU time in nanoseconds. A non-positive delta leaves the state untouched.
    pub fn advance(&mut self, sample: ClockSample) -> Option<i64> {
        let delta_ticks = sample.cpu_ticks.wrapping_sub(self.prev_cpu_ticks) as i64;
        if delta_ticks <= 0 {
            return None;
        }
        self.prev_cpu_ticks = sample.cpu_ticks;
        Some(ticks_to_ns(delta_ticks, self.cpu_ticks_per_second))
    }
}

fn ticks_to_ns(ticks: i64, ticks_per_second: u64) -> i64 {
    let ns = ticks as i128 * 1_000_000_000 / ticks_per_second as i128;
    ns.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Nanoseconds per GPU tick for a queue running at `frequency` ticks per second.
pub fn period_ns(frequency: u64) -> f32 {
    (1e9 / frequency as f64) as f32
}
