//! Monotonic timestamps shared by capture and encode
//!
//! Frames are stamped with `CLOCK_MONOTONIC` microseconds so that the
//! encoder read-back loop can measure capture-to-packet latency.

use nix::time::{clock_gettime, ClockId};

/// Current `CLOCK_MONOTONIC` time in microseconds
pub fn monotonic_us() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000,
        // CLOCK_MONOTONIC is always available on Linux
        Err(_) => 0,
    }
}
