//! HDMI video capture and encoding
//!
//! Capture frames from the HDMI bridge into DMA buffers, hand them to the
//! H.264 encoder and deliver the packets to a [`FrameSink`].

pub mod buffer;
pub mod capture;
pub mod dma_heap;
pub mod edid;
pub mod encoder;
pub mod format;
pub mod hal;
pub mod monitor;
pub mod service;
pub mod sink;
pub mod streamer;
pub mod subdev;
pub mod v4l2r_capture;

pub use buffer::{MemoryPool, SlotArena, SlotOwner};
pub use capture::PipelineContext;
pub use dma_heap::DmaHeapAllocator;
pub use format::{CaptureFormat, DvTimings, PixelFormat, SignalState, VideoState};
pub use monitor::{SignalMonitor, SignalShared};
pub use service::{VideoBackends, VideoService};
pub use sink::{BroadcastSink, EncodedPacket, EncodedVideoFrame, FrameSink, WriterSink};
pub use streamer::StreamController;
pub use subdev::V4l2Subdev;
pub use v4l2r_capture::{V4l2rCaptureDevice, V4l2rCaptureOpener};
