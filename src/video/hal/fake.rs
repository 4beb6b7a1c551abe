//! In-memory stand-ins for the hardware traits (tests only)

use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    CaptureDevice, CaptureDeviceOpener, ChannelAttr, DequeuedBuffer, DmaAllocator, DmaBuffer,
    EncodeEngine, HdmiSubdevice, QueriedBuffer, RawFrame, StreamPacket, SubdevEvent,
};
use crate::error::{AppError, Result};
use crate::video::format::{DvTimings, PixelFormat};
use crate::video::sink::{EncodedPacket, FrameSink};

// ============================================================================
// Memory
// ============================================================================

pub struct HeapBuffer {
    data: Vec<u8>,
}

impl HeapBuffer {
    pub fn filled(len: usize, value: u8) -> Self {
        Self {
            data: vec![value; len],
        }
    }
}

impl DmaBuffer for HeapBuffer {
    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, f: &mut dyn FnMut(&[u8])) -> Result<()> {
        f(&self.data);
        Ok(())
    }
}

pub struct HeapAllocator;

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Box<dyn DmaBuffer>> {
        Ok(Box::new(HeapBuffer::filled(size, 0)))
    }
}

// ============================================================================
// Capture device
// ============================================================================

/// Shared record of everything the fake capture devices did
#[derive(Default)]
pub struct CaptureLog {
    /// Ordered log: "open", "s_fmt WxH", "reqbufs N", "streamon", "streamoff", "close"
    pub events: Vec<String>,
    pub open_failures: usize,
    pub reqbufs_failure: bool,
    /// Devices currently open
    pub open_devices: usize,
    pub max_open_devices: usize,
    /// Index the next dequeue reports instead of the real one
    pub bogus_dequeue: Option<u32>,
}

#[derive(Clone)]
pub struct FakeOpener {
    pub log: Arc<Mutex<CaptureLog>>,
    frame_interval: Duration,
}

impl FakeOpener {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            log: Arc::new(Mutex::new(CaptureLog::default())),
            frame_interval,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().events.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log.lock().events.iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn wait_for(&self, prefix: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count(prefix) >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl CaptureDeviceOpener for FakeOpener {
    fn open(&self) -> Result<Box<dyn CaptureDevice>> {
        let mut log = self.log.lock();
        if log.open_failures > 0 {
            log.open_failures -= 1;
            log.events.push("failed_open".to_string());
            return Err(AppError::device("open", Errno::ENOENT));
        }
        log.events.push("open".to_string());
        log.open_devices += 1;
        log.max_open_devices = log.max_open_devices.max(log.open_devices);
        Ok(Box::new(FakeCaptureDevice {
            log: self.log.clone(),
            frame_interval: self.frame_interval,
            queued: VecDeque::new(),
            streaming: false,
            buffer_count: 0,
        }))
    }

    fn describe(&self) -> String {
        "fake-capture".to_string()
    }
}

pub struct FakeCaptureDevice {
    log: Arc<Mutex<CaptureLog>>,
    frame_interval: Duration,
    queued: VecDeque<u32>,
    streaming: bool,
    buffer_count: u32,
}

impl CaptureDevice for FakeCaptureDevice {
    fn set_format(&mut self, width: u32, height: u32, _format: PixelFormat) -> Result<()> {
        self.log.lock().events.push(format!("s_fmt {}x{}", width, height));
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut log = self.log.lock();
        if log.reqbufs_failure {
            return Err(AppError::device("VIDIOC_REQBUFS", Errno::ENOMEM));
        }
        log.events.push(format!("reqbufs {}", count));
        self.buffer_count = count;
        Ok(count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<QueriedBuffer> {
        if index >= self.buffer_count {
            return Err(AppError::device("VIDIOC_QUERYBUF", Errno::EINVAL));
        }
        Ok(QueriedBuffer { index, length: 64 })
    }

    fn queue_buffer(&mut self, index: u32, _buffer: &dyn DmaBuffer) -> Result<()> {
        self.queued.push_back(index);
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.streaming = true;
        self.log.lock().events.push("streamon".to_string());
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.log.lock().events.push("streamoff".to_string());
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        if !self.streaming || self.queued.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(20)));
            return Ok(false);
        }
        std::thread::sleep(self.frame_interval);
        Ok(true)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| AppError::device("VIDIOC_DQBUF", Errno::EAGAIN))?;
        let index = self.log.lock().bogus_dequeue.take().unwrap_or(index);
        Ok(DequeuedBuffer {
            index,
            bytes_used: 64,
            sequence: 0,
        })
    }
}

impl Drop for FakeCaptureDevice {
    fn drop(&mut self) {
        let mut log = self.log.lock();
        log.events.push("close".to_string());
        log.open_devices -= 1;
    }
}

// ============================================================================
// Encode engine
// ============================================================================

#[derive(Default)]
struct EngineState {
    created: Vec<ChannelAttr>,
    receiving: bool,
    queue: VecDeque<StreamPacket>,
    /// Sequences accepted by send_frame
    accepted: Vec<u64>,
    send_attempts: usize,
    send_failures: usize,
    fail_fetch: bool,
    fail_start_recv: bool,
    released: usize,
    destroyed: usize,
}

pub struct FakeEngine {
    state: Mutex<EngineState>,
    cond: Condvar,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            cond: Condvar::new(),
        }
    }

    /// Make the next `n` send_frame calls fail
    pub fn fail_sends(&self, n: usize) {
        self.state.lock().send_failures = n;
    }

    pub fn fail_next_fetch(&self) {
        self.state.lock().fail_fetch = true;
        self.cond.notify_all();
    }

    pub fn fail_start_recv(&self) {
        self.state.lock().fail_start_recv = true;
    }

    pub fn created_attrs(&self) -> Vec<ChannelAttr> {
        self.state.lock().created.clone()
    }

    pub fn accepted(&self) -> Vec<u64> {
        self.state.lock().accepted.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    pub fn destroyed(&self) -> usize {
        self.state.lock().destroyed
    }
}

impl EncodeEngine for FakeEngine {
    fn create_channel(&self, attr: &ChannelAttr) -> Result<()> {
        self.state.lock().created.push(attr.clone());
        Ok(())
    }

    fn destroy_channel(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.destroyed += 1;
        state.queue.clear();
        Ok(())
    }

    fn start_recv_frame(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_start_recv {
            return Err(AppError::Encoder {
                op: "start_recv_frame",
                code: -1,
            });
        }
        state.receiving = true;
        Ok(())
    }

    fn stop_recv_frame(&self) -> Result<()> {
        self.state.lock().receiving = false;
        self.cond.notify_all();
        Ok(())
    }

    fn send_frame(&self, frame: &RawFrame<'_>, _timeout: Duration) -> Result<()> {
        let mut first = 0u8;
        frame.buffer.read(&mut |data| first = data.first().copied().unwrap_or(0))?;

        let mut state = self.state.lock();
        state.send_attempts += 1;
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(AppError::Encoder {
                op: "send_frame",
                code: 0xa004_8006u32 as i32,
            });
        }
        if !state.receiving {
            return Err(AppError::Encoder {
                op: "send_frame",
                code: -1,
            });
        }
        state.accepted.push(frame.sequence);
        state.queue.push_back(StreamPacket {
            sequence: frame.sequence,
            pts_us: frame.pts_us,
            data: vec![0, 0, 0, 1, first],
            key_frame: frame.sequence % 60 == 0,
        });
        self.cond.notify_all();
        Ok(())
    }

    fn get_stream(&self, timeout: Duration) -> Result<Option<StreamPacket>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.fail_fetch {
                state.fail_fetch = false;
                return Err(AppError::Encoder {
                    op: "get_stream",
                    code: -1,
                });
            }
            if let Some(packet) = state.queue.pop_front() {
                return Ok(Some(packet));
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn release_stream(&self, _packet: StreamPacket) -> Result<()> {
        self.state.lock().released += 1;
        Ok(())
    }
}

// ============================================================================
// HDMI subdevice
// ============================================================================

#[derive(Default)]
struct SubdevState {
    /// Scripted query results, consumed in order; the last one repeats
    script: VecDeque<std::result::Result<DvTimings, Errno>>,
    events: VecDeque<SubdevEvent>,
    fail_wait: bool,
    subscribed: bool,
    queries: usize,
    edid: Vec<u8>,
    log_status_calls: usize,
}

pub struct FakeSubdev {
    state: Mutex<SubdevState>,
    cond: Condvar,
}

impl FakeSubdev {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SubdevState {
                edid: vec![0u8; 256],
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn script(&self, results: Vec<std::result::Result<DvTimings, Errno>>) {
        self.state.lock().script = results.into();
    }

    pub fn push_source_change(&self) {
        self.state
            .lock()
            .events
            .push_back(SubdevEvent::SourceChange { changes: 1 });
        self.cond.notify_all();
    }

    pub fn push_event(&self, event: SubdevEvent) {
        self.state.lock().events.push_back(event);
        self.cond.notify_all();
    }

    pub fn fail_next_wait(&self) {
        self.state.lock().fail_wait = true;
        self.cond.notify_all();
    }

    pub fn queries(&self) -> usize {
        self.state.lock().queries
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    pub fn edid(&self) -> Vec<u8> {
        self.state.lock().edid.clone()
    }

    pub fn set_stored_edid(&self, edid: Vec<u8>) {
        self.state.lock().edid = edid;
    }

    pub fn log_status_calls(&self) -> usize {
        self.state.lock().log_status_calls
    }
}

impl HdmiSubdevice for FakeSubdev {
    fn query_dv_timings(&self) -> Result<DvTimings> {
        let mut state = self.state.lock();
        state.queries += 1;
        let result = if state.script.len() > 1 {
            state.script.pop_front()
        } else {
            state.script.front().cloned()
        };
        match result {
            Some(Ok(timings)) => Ok(timings),
            Some(Err(errno)) => Err(AppError::device("VIDIOC_QUERY_DV_TIMINGS", errno)),
            None => Err(AppError::device("VIDIOC_QUERY_DV_TIMINGS", Errno::ENOLINK)),
        }
    }

    fn subscribe_source_change(&self) -> Result<()> {
        self.state.lock().subscribed = true;
        Ok(())
    }

    fn unsubscribe_events(&self) -> Result<()> {
        self.state.lock().subscribed = false;
        self.cond.notify_all();
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Result<Option<SubdevEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.fail_wait {
                state.fail_wait = false;
                return Err(AppError::device("VIDIOC_DQEVENT", Errno::EIO));
            }
            if let Some(event) = state.events.pop_front() {
                return Ok(Some(event));
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn get_edid(&self, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let len = state.edid.len().min(buf.len());
        buf[..len].copy_from_slice(&state.edid[..len]);
        Ok(len)
    }

    fn set_edid(&self, edid: &[u8]) -> Result<()> {
        self.state.lock().edid = edid.to_vec();
        Ok(())
    }

    fn log_status(&self) -> Result<()> {
        self.state.lock().log_status_calls += 1;
        Ok(())
    }
}

/// CEA-861 1920x1080@60 timings
pub fn timings_1080p60() -> DvTimings {
    DvTimings {
        width: 1920,
        height: 1080,
        pixelclock: 148_500_000,
        hfrontporch: 88,
        hsync: 44,
        hbackporch: 148,
        vfrontporch: 4,
        vsync: 5,
        vbackporch: 36,
    }
}

/// CEA-861 1280x720@60 timings
pub fn timings_720p60() -> DvTimings {
    DvTimings {
        width: 1280,
        height: 720,
        pixelclock: 74_250_000,
        hfrontporch: 110,
        hsync: 40,
        hbackporch: 220,
        vfrontporch: 5,
        vsync: 5,
        vbackporch: 20,
    }
}

// ============================================================================
// Sink
// ============================================================================

pub struct RecordingSink {
    sequences: Mutex<Vec<u64>>,
    cond: Condvar,
    calls: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            sequences: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.sequences.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` packets were delivered
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sequences = self.sequences.lock();
        while sequences.len() < count {
            if self.cond.wait_until(&mut sequences, deadline).timed_out() {
                return sequences.len() >= count;
            }
        }
        true
    }
}

impl FrameSink for RecordingSink {
    fn on_encoded_frame(&self, packet: &EncodedPacket<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sequences.lock().push(packet.sequence);
        self.cond.notify_all();
    }
}
