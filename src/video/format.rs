//! Capture geometry, HDMI signal state and pixel format definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum resolution the capture pool is sized for
pub const MAX_WIDTH: u32 = 1920;
pub const MAX_HEIGHT: u32 = 1080;

/// Raw pixel formats accepted by the capture/encode path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed format (what the HDMI bridge delivers)
    Yuyv,
}

impl PixelFormat {
    /// V4L2 FourCC code
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Yuyv => write!(f, "YUYV"),
        }
    }
}

/// Frame geometry published by the signal monitor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl CaptureFormat {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self { width, height, fps }
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{:.2}", self.width, self.height, self.fps)
    }
}

/// Digital video timings reported by the HDMI receiver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DvTimings {
    pub width: u32,
    pub height: u32,
    /// Pixel clock in Hz
    pub pixelclock: u64,
    pub hfrontporch: u32,
    pub hsync: u32,
    pub hbackporch: u32,
    pub vfrontporch: u32,
    pub vsync: u32,
    pub vbackporch: u32,
}

impl DvTimings {
    /// Total line length including horizontal blanking
    pub fn total_width(&self) -> u64 {
        (self.width + self.hfrontporch + self.hsync + self.hbackporch) as u64
    }

    /// Total frame height including vertical blanking
    pub fn total_height(&self) -> u64 {
        (self.height + self.vfrontporch + self.vsync + self.vbackporch) as u64
    }

    /// Refresh rate derived from the pixel clock
    pub fn frames_per_second(&self) -> f64 {
        let total = self.total_width() * self.total_height();
        if total == 0 {
            return 0.0;
        }
        self.pixelclock as f64 / total as f64
    }

    pub fn to_format(&self) -> CaptureFormat {
        CaptureFormat::new(self.width, self.height, self.frames_per_second())
    }
}

/// HDMI input state; exactly one is current at any time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalState {
    /// No cable or no link
    NoSignal,
    /// Timing present but the receiver cannot lock
    Unstable,
    /// Timing detected but outside the supported range
    OutOfRange,
    /// Locked onto a usable format
    Locked(CaptureFormat),
}

impl SignalState {
    pub fn format(&self) -> Option<CaptureFormat> {
        match self {
            SignalState::Locked(format) => Some(*format),
            _ => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, SignalState::Locked(_))
    }

    /// Error code reported to clients (None when locked)
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            SignalState::NoSignal => Some("no_signal"),
            SignalState::Unstable => Some("no_lock"),
            SignalState::OutOfRange => Some("out_of_range"),
            SignalState::Locked(_) => None,
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        SignalState::NoSignal
    }
}

/// Video input state as seen by clients
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoState {
    pub ready: bool,
    /// no_signal, no_lock, out_of_range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl From<SignalState> for VideoState {
    fn from(state: SignalState) -> Self {
        match state {
            SignalState::Locked(format) => Self {
                ready: true,
                error: None,
                width: format.width,
                height: format.height,
                fps: format.fps,
            },
            other => Self {
                ready: false,
                error: other.error_code().map(str::to_string),
                width: 0,
                height: 0,
                fps: 0.0,
            },
        }
    }
}

/// Round up to a multiple of two (encoder virtual stride alignment)
pub fn align2(value: u32) -> u32 {
    (value + 1) & !1
}
