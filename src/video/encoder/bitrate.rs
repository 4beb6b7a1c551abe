//! Bitrate selection from the user quality factor

use crate::video::format::{MAX_HEIGHT, MAX_WIDTH};

/// Bitrate at quality 0.0 for 1080p, kbps
pub const BASE_BITRATE_LOW_KBPS: i32 = 512;
/// Bitrate at quality 1.0 for 1080p, kbps
pub const BASE_BITRATE_HIGH_KBPS: i32 = 2000;
/// Floor for tiny resolutions, kbps
pub const MIN_BITRATE_KBPS: i32 = 100;

/// Target bitrate (kbps) for a quality factor in [0, 1] and a resolution
///
/// The base rate is interpolated between 512 and 2000 kbps, then scaled by
/// the pixel count relative to 1920x1080 and floored at 100 kbps.
pub fn compute_bitrate(quality_factor: f64, width: u32, height: u32) -> u32 {
    let pixels = width as f64 * height as f64;
    let ref_pixels = MAX_WIDTH as f64 * MAX_HEIGHT as f64;
    let scale = pixels / ref_pixels;

    let base = BASE_BITRATE_LOW_KBPS
        + ((BASE_BITRATE_HIGH_KBPS - BASE_BITRATE_LOW_KBPS) as f64 * quality_factor) as i32;
    let bitrate = (base as f64 * scale) as i32;

    bitrate.max(MIN_BITRATE_KBPS) as u32
}

/// Peak bitrate for VBR rate control
pub fn max_bitrate(bitrate_kbps: u32) -> u32 {
    bitrate_kbps.saturating_mul(2)
}
