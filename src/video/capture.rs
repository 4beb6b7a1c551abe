//! Capture pipeline worker
//!
//! One worker thread runs per streaming session. Each attempt opens the
//! capture device, negotiates YUYV at the format the signal monitor locked
//! onto, binds pool blocks to three DMABUF slots, starts the H.264 channel
//! and then cycles every slot through dequeue -> submit -> re-queue until
//! cancelled. Any hard failure tears the attempt down and, while the session
//! is still running, starts over from the device open.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::{MemoryPool, SlotArena, SlotOwner, CAPTURE_BUFFER_COUNT};
use super::encoder::{compute_bitrate, max_bitrate, H264Channel};
use super::format::{align2, CaptureFormat, PixelFormat};
use super::hal::{CaptureDevice, CaptureDeviceOpener, EncodeEngine, RawFrame};
use super::monitor::SignalShared;
use super::sink::FrameSink;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::utils::monotonic_us;

/// Bounded wait for a filled capture buffer
const READY_TIMEOUT: Duration = Duration::from_secs(1);
/// Back-off after the capture device failed to open
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Back-off after a failed or aborted attempt
const ATTEMPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Poll step while waiting for the monitor to lock onto a signal
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Pause before the single submit retry
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Everything a pipeline worker needs, shared by all sessions
pub struct PipelineContext {
    pub opener: Arc<dyn CaptureDeviceOpener>,
    pub engine: Arc<dyn EncodeEngine>,
    pub sink: Arc<dyn FrameSink>,
    pub pool: MemoryPool,
    pub signal: Arc<SignalShared>,
    pub events: Option<Arc<EventBus>>,
}

impl PipelineContext {
    fn publish_error(&self, stage: &str, err: &AppError) {
        if let Some(events) = &self.events {
            events.publish(SystemEvent::StreamError {
                stage: stage.to_string(),
                message: err.to_string(),
            });
        }
    }
}

/// Resources of one capture attempt
///
/// Dropping a session releases everything in order: stream off, encoder
/// stop, slot blocks back to the pool, device close.
struct Session {
    channel: H264Channel,
    arena: SlotArena,
    device: Box<dyn CaptureDevice>,
    format: CaptureFormat,
    streaming: bool,
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(e) = self.device.stream_off() {
                warn!("Failed to stop capture stream: {}", e);
            }
        }
        if let Err(e) = self.channel.stop() {
            warn!("Failed to stop encode channel: {}", e);
        }
        debug!(
            "Capture session torn down ({} slots released)",
            self.arena.len()
        );
        // arena, then device, drop in field order
    }
}

/// Pipeline worker entry point; returns when cancelled or on a contract violation
pub fn run_pipeline(ctx: Arc<PipelineContext>, quality_factor: f64, cancel: CancellationToken) {
    info!(
        "Pipeline worker started (device={}, quality={:.2})",
        ctx.opener.describe(),
        quality_factor
    );

    while !cancel.is_cancelled() {
        let Some(format) = wait_for_lock(&ctx.signal, &cancel) else {
            break;
        };

        let device = match ctx.opener.open() {
            Ok(device) => device,
            Err(e) => {
                warn!(
                    "Failed to open capture device {}: {}",
                    ctx.opener.describe(),
                    e
                );
                ctx.publish_error("open", &e);
                sleep_cancellable(&cancel, OPEN_RETRY_DELAY);
                continue;
            }
        };

        let mut session = match setup_session(&ctx, device, format, quality_factor) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to set up capture session: {}", e);
                ctx.publish_error("setup", &e);
                sleep_cancellable(&cancel, ATTEMPT_RETRY_DELAY);
                continue;
            }
        };

        match capture_frames(&mut session, &ctx.signal, &cancel) {
            Ok(()) => {}
            Err(e @ AppError::Contract(_)) => {
                error!("Capture pipeline aborted: {}", e);
                ctx.publish_error("capture", &e);
                break;
            }
            Err(e) => {
                error!("Capture failed: {}", e);
                ctx.publish_error("capture", &e);
                drop(session);
                sleep_cancellable(&cancel, ATTEMPT_RETRY_DELAY);
            }
        }
    }

    info!("Pipeline worker exiting");
}

/// Block until the monitor reports a locked format; None when cancelled
fn wait_for_lock(signal: &SignalShared, cancel: &CancellationToken) -> Option<CaptureFormat> {
    let mut logged = false;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(format) = signal.current().format() {
            return Some(format);
        }
        if !logged {
            debug!("Waiting for HDMI signal lock");
            logged = true;
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
    }
}

/// Negotiate the format, bind slots, stream on and start the encoder
fn setup_session(
    ctx: &PipelineContext,
    device: Box<dyn CaptureDevice>,
    format: CaptureFormat,
    quality_factor: f64,
) -> Result<Session> {
    let mut session = Session {
        channel: H264Channel::new(ctx.engine.clone(), ctx.sink.clone()),
        arena: SlotArena::new(),
        device,
        format,
        streaming: false,
    };

    session
        .device
        .set_format(format.width, format.height, PixelFormat::Yuyv)?;

    let granted = session
        .device
        .request_buffers(CAPTURE_BUFFER_COUNT as u32)?;
    if granted as usize != CAPTURE_BUFFER_COUNT {
        return Err(AppError::VideoError(format!(
            "driver granted {} capture buffers, need {}",
            granted, CAPTURE_BUFFER_COUNT
        )));
    }

    for index in 0..granted {
        let queried = session.device.query_buffer(index)?;
        let block = ctx.pool.acquire(queried.length as usize)?;
        session.arena.push(block);
        debug!("Bound slot {} ({} bytes)", index, queried.length);
    }

    for index in 0..granted {
        let buffer = session
            .arena
            .buffer(index)
            .ok_or_else(|| AppError::Contract(format!("slot {} missing", index)))?;
        session.device.queue_buffer(index, buffer)?;
        session.arena.mark_queued(index)?;
    }

    session.device.stream_on()?;
    session.streaming = true;

    let bitrate = compute_bitrate(quality_factor, format.width, format.height);
    session.channel.start(
        bitrate,
        max_bitrate(bitrate),
        format.width,
        format.height,
    )?;

    info!(
        "Capture session started: {} bitrate={}kbps",
        format, bitrate
    );
    Ok(session)
}

/// Frame loop of one session
///
/// Returns `Ok(())` when cancelled or when the monitor no longer reports a
/// locked signal; the caller then tears the session down.
fn capture_frames(
    session: &mut Session,
    signal: &SignalShared,
    cancel: &CancellationToken,
) -> Result<()> {
    let (width, height) = (session.format.width, session.format.height);
    let mut sequence = 0u64;
    let mut dropped = 0u64;

    while !cancel.is_cancelled() {
        if !signal.current().is_locked() {
            info!("HDMI signal lost, stopping capture session");
            break;
        }

        match session.device.wait_ready(READY_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e),
        }

        let dequeued = match session.device.dequeue_buffer() {
            Ok(dequeued) => dequeued,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e),
        };
        let index = dequeued.index;

        // Anything but a driver-owned slot ends the worker
        let buffer = session.arena.take_from_driver(index)?;

        let frame = RawFrame {
            buffer,
            width,
            height,
            vir_width: align2(width),
            vir_height: align2(height),
            format: PixelFormat::Yuyv,
            sequence,
            pts_us: monotonic_us(),
        };
        sequence += 1;

        if !submit_with_retry(&session.channel, &frame) {
            dropped += 1;
        }

        requeue(session, index)?;
    }

    info!(
        "Capture loop stopped ({} frames, {} dropped)",
        sequence, dropped
    );
    Ok(())
}

/// Submit a frame, retrying once; false when the frame was dropped
fn submit_with_retry(channel: &H264Channel, frame: &RawFrame<'_>) -> bool {
    let Err(first) = channel.submit(frame) else {
        return true;
    };
    debug!("Submit of frame {} failed, retrying: {}", frame.sequence, first);

    std::thread::sleep(SUBMIT_RETRY_DELAY);
    match channel.submit(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Dropping frame {}: {}", frame.sequence, e);
            false
        }
    }
}

/// Return an in-flight slot to the driver
fn requeue(session: &mut Session, index: u32) -> Result<()> {
    let buffer = session
        .arena
        .buffer(index)
        .ok_or_else(|| AppError::Contract(format!("slot {} missing", index)))?;

    match session.device.queue_buffer(index, buffer) {
        Ok(()) => session.arena.mark_queued(index),
        Err(e) => {
            error!("Failed to re-queue slot {}: {}", index, e);
            session.arena.release(index)?;
            if session.arena.count(SlotOwner::Driver) == 0 {
                return Err(AppError::VideoError(
                    "no capture slots left queued".to_string(),
                ));
            }
            Ok(())
        }
    }
}

/// Sleep in short steps, returning early when cancelled
pub(crate) fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) {
    const STEP: Duration = Duration::from_millis(10);
    let mut remaining = duration;
    while !remaining.is_zero() && !cancel.is_cancelled() {
        let step = remaining.min(STEP);
        std::thread::sleep(step);
        remaining -= step;
    }
}
