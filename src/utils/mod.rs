//! Utility modules
//!
//! This module contains common utilities used across the codebase.

pub mod clock;

pub use clock::monotonic_us;
