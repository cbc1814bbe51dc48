//! Transport-level frame limiting
//!
//! This guards the socket reader against floods of any message type. The
//! finer per-connection input policy (sequence checks, sliding window) lives
//! in the input gate.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified frames per second
pub fn create_limiter(frames_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(frames_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Per-connection frame limiter
#[derive(Clone)]
pub struct FrameLimiter {
    limiter: Arc<Limiter>,
}

impl FrameLimiter {
    pub fn new(frames_per_second: u32) -> Self {
        Self {
            limiter: create_limiter(frames_per_second),
        }
    }

    /// Check if another inbound frame is allowed (returns true if allowed)
    pub fn check_frame(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_is_cut_off() {
        let limiter = FrameLimiter::new(5);
        let allowed = (0..50).filter(|_| limiter.check_frame()).count();
        assert!(allowed >= 5);
        assert!(allowed < 50);
    }
}
