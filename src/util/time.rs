//! Time utilities for the simulation and the wire protocol

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Fixed physics timestep in seconds for a given tick rate
pub fn tick_delta(tick_rate: u32) -> f32 {
    1.0 / tick_rate.max(1) as f32
}

/// Simulation clock in milliseconds derived from the tick counter.
/// Phase timers and retention windows run on this clock so they stay
/// deterministic regardless of scheduling jitter.
pub fn tick_millis(tick: u64, tick_rate: u32) -> u64 {
    tick * 1_000 / tick_rate.max(1) as u64
}

/// Convert a duration in seconds to a tick count
pub fn secs_to_ticks(secs: f32, tick_rate: u32) -> u32 {
    (secs * tick_rate as f32).round() as u32
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_clock_is_exact_at_sixty_hz() {
        assert_eq!(tick_millis(60, 60), 1_000);
        assert_eq!(tick_millis(18_000, 60), 300_000);
        assert_eq!(secs_to_ticks(3.0, 60), 180);
    }
}
