//! Hardware seams of the capture/encode pipeline
//!
//! The pipeline only talks to hardware through these traits:
//! - [`CaptureDevice`] - V4L2 capture queue (format, DMABUF slots, stream on/off)
//! - [`EncodeEngine`] - H.264 encode channel (intake, packet read-back)
//! - [`HdmiSubdevice`] - HDMI receiver (timings, source-change events, EDID)
//! - [`DmaAllocator`] - DMA-capable memory shared between capture and encode
//!
//! Every fallible call reports a POSIX errno (device side) or an engine code
//! through [`AppError`](crate::error::AppError).

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::video::format::{DvTimings, PixelFormat};

// ============================================================================
// DMA memory
// ============================================================================

/// A DMA-capable memory block exported as a dmabuf file descriptor
pub trait DmaBuffer: Send + Sync {
    /// dmabuf file descriptor handed to the capture driver
    fn raw_fd(&self) -> RawFd;

    /// Size of the block in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the CPU view of the block, bracketed by cache sync
    fn read(&self, f: &mut dyn FnMut(&[u8])) -> Result<()>;
}

/// Allocates DMA blocks (dma-heap, vendor pools, ...)
pub trait DmaAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<Box<dyn DmaBuffer>>;
}

// ============================================================================
// Capture device
// ============================================================================

/// Plane description returned by `VIDIOC_QUERYBUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueriedBuffer {
    pub index: u32,
    /// Plane length the driver expects
    pub length: u32,
}

/// Buffer returned by `VIDIOC_DQBUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    /// Driver frame counter
    pub sequence: u32,
}

/// An opened capture device (one per streaming session)
///
/// Dropping the device closes it.
pub trait CaptureDevice: Send {
    /// Negotiate pixel format and resolution
    fn set_format(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()>;

    /// Request `count` DMABUF slots; returns the number granted
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    fn query_buffer(&mut self, index: u32) -> Result<QueriedBuffer>;

    /// Hand slot `index`, backed by `buffer`, to the driver
    fn queue_buffer(&mut self, index: u32, buffer: &dyn DmaBuffer) -> Result<()>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    /// Block until a filled buffer is ready; `Ok(false)` on timeout
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool>;

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer>;
}

/// Opens the capture device at session start
pub trait CaptureDeviceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureDevice>>;

    /// Human readable device name for logs
    fn describe(&self) -> String;
}

// ============================================================================
// Encode engine
// ============================================================================

/// Rate control mode of the encode channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Variable bitrate bounded by `max_bitrate_kbps`
    Vbr,
}

/// H.264 profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

/// Encode channel attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAttr {
    pub rate_control: RateControl,
    pub profile: H264Profile,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Peak bitrate in kbps
    pub max_bitrate_kbps: u32,
    /// Keyframe interval in frames
    pub gop: u32,
    pub input_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub vir_width: u32,
    pub vir_height: u32,
    /// Depth of the engine's internal stream buffer queue
    pub stream_buf_count: u32,
    /// Size of each output stream buffer
    pub buf_size: u32,
}

/// Raw frame handed to the engine; the block is borrowed for the call only
pub struct RawFrame<'a> {
    pub buffer: &'a dyn DmaBuffer,
    pub width: u32,
    pub height: u32,
    pub vir_width: u32,
    pub vir_height: u32,
    pub format: PixelFormat,
    /// Monotonically increasing frame number
    pub sequence: u64,
    /// Capture timestamp, CLOCK_MONOTONIC microseconds
    pub pts_us: u64,
}

/// Encoded packet owned by the engine until released
#[derive(Debug)]
pub struct StreamPacket {
    pub sequence: u64,
    pub pts_us: u64,
    pub data: Vec<u8>,
    pub key_frame: bool,
}

/// H.264 encode channel
///
/// The engine hosts a single channel; callers serialize create/destroy.
pub trait EncodeEngine: Send + Sync {
    fn create_channel(&self, attr: &ChannelAttr) -> Result<()>;

    fn destroy_channel(&self) -> Result<()>;

    fn start_recv_frame(&self) -> Result<()>;

    fn stop_recv_frame(&self) -> Result<()>;

    /// Submit a raw frame, blocking at most `timeout`
    fn send_frame(&self, frame: &RawFrame<'_>, timeout: Duration) -> Result<()>;

    /// Fetch an encoded packet; `Ok(None)` when nothing arrived within `timeout`
    fn get_stream(&self, timeout: Duration) -> Result<Option<StreamPacket>>;

    fn release_stream(&self, packet: StreamPacket) -> Result<()>;
}

// ============================================================================
// HDMI subdevice
// ============================================================================

/// Event dequeued from the subdevice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdevEvent {
    /// V4L2_EVENT_SOURCE_CHANGE with its change flags
    SourceChange { changes: u32 },
    /// Any other event type
    Other(u32),
}

/// HDMI receiver control subdevice
pub trait HdmiSubdevice: Send + Sync {
    /// Query current timings; fails with ENOLINK / ENOLCK / ERANGE when unusable
    fn query_dv_timings(&self) -> Result<DvTimings>;

    fn subscribe_source_change(&self) -> Result<()>;

    fn unsubscribe_events(&self) -> Result<()>;

    /// Wait for the next event; `Ok(None)` on timeout
    fn wait_event(&self, timeout: Duration) -> Result<Option<SubdevEvent>>;

    /// Read EDID into `buf` (128 or 256 bytes); returns bytes read
    fn get_edid(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write EDID (128 or 256 bytes, checksums already fixed)
    fn set_edid(&self, edid: &[u8]) -> Result<()>;

    /// Ask the driver to dump its status to the kernel log
    fn log_status(&self) -> Result<()>;
}

#[cfg(test)]
pub mod fake;
