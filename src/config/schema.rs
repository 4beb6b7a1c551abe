use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// HDMI capture settings
    pub video: VideoConfig,
    /// H.264 encoder settings
    pub encoder: EncoderConfig,
}

/// HDMI capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Capture device path (multi-planar V4L2 node)
    pub capture_device: String,
    /// HDMI receiver subdevice path
    pub subdev_device: String,
    /// DMA heap used for capture buffers
    pub dma_heap: String,
    /// Stream quality factor in [0, 1]
    pub quality_factor: f64,
    /// Pause between cancelling a pipeline worker and joining it (ms)
    pub stop_settle_ms: u64,
    /// EDID to apply at startup (hex), None keeps the receiver's EDID
    pub edid: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            capture_device: "/dev/video0".to_string(),
            subdev_device: "/dev/v4l-subdev2".to_string(),
            dma_heap: "/dev/dma_heap/system".to_string(),
            quality_factor: 1.0,
            stop_settle_ms: 1000,
            edid: None,
        }
    }
}

/// Software encoder speed/quality preset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPreset {
    Ultrafast,
    Superfast,
    #[default]
    Veryfast,
    Faster,
    Fast,
    Medium,
}

/// H.264 encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Preset of the software engine
    pub preset: EncoderPreset,
    /// Nominal input frame rate for rate control
    pub fps: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preset: EncoderPreset::Veryfast,
            fps: 60,
        }
    }
}

impl AppConfig {
    /// Check values a caller could have set out of range
    pub fn validate(&self) -> crate::error::Result<()> {
        let q = self.video.quality_factor;
        if !(0.0..=1.0).contains(&q) {
            return Err(crate::error::AppError::Config(format!(
                "video.quality_factor {} outside [0, 1]",
                q
            )));
        }
        if self.encoder.fps == 0 {
            return Err(crate::error::AppError::Config(
                "encoder.fps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
