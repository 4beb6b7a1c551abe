//! H.264 encode channel lifecycle and packet read-back
//!
//! One [`H264Channel`] wraps the single channel of an [`EncodeEngine`]:
//!
//! ```text
//!   Idle --start()--> Active --stop()--> Idle
//! ```
//!
//! While active, a read-back thread fetches packets (200ms bounded waits),
//! hands each one to the [`FrameSink`] as a borrowed [`EncodedPacket`] and
//! releases it back to the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::error::{AppError, Result};
use crate::utils::monotonic_us;
use crate::video::format::{align2, PixelFormat};
use crate::video::hal::{ChannelAttr, EncodeEngine, H264Profile, RateControl, RawFrame};
use crate::video::sink::{EncodedPacket, FrameSink};

/// Keyframe interval in frames
pub const GOP_FRAMES: u32 = 60;
/// Depth of the engine's internal stream buffering
pub const STREAM_BUFFER_COUNT: u32 = 3;
/// Bounded wait for one encoded packet
pub const FETCH_TIMEOUT: Duration = Duration::from_millis(200);
/// Bounded wait for the engine to accept a raw frame
pub const SEND_TIMEOUT: Duration = Duration::from_millis(2000);

/// Encode channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Active,
}

struct ActiveChannel {
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

/// Build the channel attributes for a session
pub fn channel_attr(bitrate_kbps: u32, max_bitrate_kbps: u32, width: u32, height: u32) -> ChannelAttr {
    ChannelAttr {
        rate_control: RateControl::Vbr,
        profile: H264Profile::High,
        bitrate_kbps,
        max_bitrate_kbps,
        gop: GOP_FRAMES,
        input_format: PixelFormat::Yuyv,
        width,
        height,
        vir_width: align2(width),
        vir_height: align2(height),
        stream_buf_count: STREAM_BUFFER_COUNT,
        buf_size: width * height * 3 / 2,
    }
}

/// Hardware H.264 encode channel
pub struct H264Channel {
    engine: Arc<dyn EncodeEngine>,
    sink: Arc<dyn FrameSink>,
    active: Option<ActiveChannel>,
}

impl H264Channel {
    pub fn new(engine: Arc<dyn EncodeEngine>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            engine,
            sink,
            active: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        if self.active.is_some() {
            ChannelState::Active
        } else {
            ChannelState::Idle
        }
    }


    /// Create the channel, start frame intake and spawn the read-back thread
    pub fn start(
        &mut self,
        bitrate_kbps: u32,
        max_bitrate_kbps: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if self.active.is_some() {
            return Err(AppError::Contract(
                "encode channel started while active".to_string(),
            ));
        }

        let attr = channel_attr(bitrate_kbps, max_bitrate_kbps, width, height);
        info!(
            "Starting H.264 channel: {}x{} bitrate={}kbps max={}kbps gop={}",
            width, height, bitrate_kbps, max_bitrate_kbps, attr.gop
        );

        self.engine.create_channel(&attr)?;

        if let Err(e) = self.engine.start_recv_frame() {
            error!("Failed to start frame intake: {}", e);
            self.destroy_quietly();
            return Err(e);
        }

        let running = Arc::new(AtomicBool::new(true));
        let engine = self.engine.clone();
        let sink = self.sink.clone();
        let flag = running.clone();
        let reader = std::thread::Builder::new()
            .name("venc-read".to_string())
            .spawn(move || read_stream_loop(engine, sink, flag));

        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn encoder read-back thread: {}", e);
                let _ = self.engine.stop_recv_frame();
                self.destroy_quietly();
                return Err(AppError::Io(e));
            }
        };

        self.active = Some(ActiveChannel {
            running,
            reader: Some(reader),
        });
        Ok(())
    }

    /// Submit one raw frame to the active channel
    pub fn submit(&self, frame: &RawFrame<'_>) -> Result<()> {
        if self.active.is_none() {
            return Err(AppError::Contract(
                "frame submitted to idle encode channel".to_string(),
            ));
        }
        self.engine.send_frame(frame, SEND_TIMEOUT)
    }

    /// Stop intake, join the read-back thread and destroy the channel
    ///
    /// Every step is attempted; the first failure is returned.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        active.running.store(false, Ordering::SeqCst);

        let mut first_error = None;
        if let Err(e) = self.engine.stop_recv_frame() {
            error!("Failed to stop frame intake: {}", e);
            first_error.get_or_insert(e);
        }

        if let Some(reader) = active.reader.take() {
            if reader.join().is_err() {
                error!("Encoder read-back thread panicked");
            }
        }

        if let Err(e) = self.engine.destroy_channel() {
            error!("Failed to destroy encode channel: {}", e);
            first_error.get_or_insert(e);
        }

        debug!("H.264 channel stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn destroy_quietly(&self) {
        if let Err(e) = self.engine.destroy_channel() {
            error!("Failed to destroy encode channel: {}", e);
        }
    }
}

impl Drop for H264Channel {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Read-back loop: fetch, deliver, release until the channel stops
fn read_stream_loop(
    engine: Arc<dyn EncodeEngine>,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
) {
    let mut loop_count = 0u64;

    while running.load(Ordering::SeqCst) {
        let packet = match engine.get_stream(FETCH_TIMEOUT) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(e) => {
                error!("Failed to fetch encoded stream: {}", e);
                break;
            }
        };

        trace!(
            "loop={} seq={} len={} pts={} delay={}us",
            loop_count,
            packet.sequence,
            packet.data.len(),
            packet.pts_us,
            monotonic_us().saturating_sub(packet.pts_us)
        );

        sink.on_encoded_frame(&EncodedPacket {
            sequence: packet.sequence,
            payload: &packet.data,
            timestamp_us: packet.pts_us,
            key_frame: packet.key_frame,
        });

        if let Err(e) = engine.release_stream(packet) {
            error!("Failed to release encoded stream: {}", e);
        }
        loop_count += 1;
    }

    info!("Exiting encoder read-back loop ({} packets)", loop_count);
}
