//! Video subsystem facade
//!
//! [`VideoService`] wires the hardware backends into the memory pool, the
//! signal monitor and the stream controller, and exposes the operations a
//! host process calls: start/stop streaming, quality, status, EDID and the
//! receiver status log.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::{MemoryPool, CAPTURE_BUFFER_COUNT};
use super::capture::PipelineContext;
use super::edid;
use super::format::{VideoState, MAX_HEIGHT, MAX_WIDTH};
use super::hal::{CaptureDeviceOpener, DmaAllocator, EncodeEngine, HdmiSubdevice};
use super::monitor::{SignalMonitor, SignalShared};
use super::sink::FrameSink;
use super::streamer::StreamController;
use crate::config::VideoConfig;
use crate::error::{AppError, Result};
use crate::events::EventBus;

/// Pool block size: one 1080p frame at up to 3 bytes per pixel
pub const POOL_BLOCK_SIZE: usize = MAX_WIDTH as usize * MAX_HEIGHT as usize * 3;

/// Reads the kernel ring buffer
pub type KernelLogReader = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Hardware the subsystem runs on
#[derive(Clone)]
pub struct VideoBackends {
    pub opener: Arc<dyn CaptureDeviceOpener>,
    pub engine: Arc<dyn EncodeEngine>,
    pub subdev: Arc<dyn HdmiSubdevice>,
    pub allocator: Arc<dyn DmaAllocator>,
    pub kernel_log: KernelLogReader,
}

struct MonitorHandle {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

/// The HDMI capture/encode subsystem
pub struct VideoService {
    controller: Arc<StreamController>,
    signal: Arc<SignalShared>,
    subdev: Arc<dyn HdmiSubdevice>,
    pool: MemoryPool,
    kernel_log: KernelLogReader,
    monitor: Mutex<Option<MonitorHandle>>,
    shut_down: AtomicBool,
}

impl VideoService {
    /// Allocate the pool, subscribe to the receiver and start the monitor
    pub fn init(
        backends: VideoBackends,
        sink: Arc<dyn FrameSink>,
        config: &VideoConfig,
        events: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        info!("Initializing video subsystem");

        let pool = MemoryPool::new(
            backends.allocator.as_ref(),
            POOL_BLOCK_SIZE,
            CAPTURE_BUFFER_COUNT,
        )?;

        if let Err(e) = backends.subdev.subscribe_source_change() {
            error!("Failed to subscribe to HDMI source changes: {}", e);
            pool.destroy();
            return Err(e);
        }

        if let Some(hex) = &config.edid {
            info!("Restoring HDMI EDID");
            if let Err(e) = apply_edid(backends.subdev.as_ref(), hex) {
                warn!("Failed to restore HDMI EDID: {}", e);
            }
        }

        let signal = Arc::new(SignalShared::new(events.clone()));
        let ctx = Arc::new(PipelineContext {
            opener: backends.opener,
            engine: backends.engine,
            sink,
            pool: pool.clone(),
            signal: signal.clone(),
            events,
        });
        let controller = Arc::new(StreamController::new(
            ctx,
            config.quality_factor,
            Duration::from_millis(config.stop_settle_ms),
        ));

        let cancel = CancellationToken::new();
        let monitor = SignalMonitor::new(
            backends.subdev.clone(),
            signal.clone(),
            controller.clone(),
        );
        let thread = match monitor.spawn(cancel.clone()) {
            Ok(thread) => thread,
            Err(e) => {
                let _ = backends.subdev.unsubscribe_events();
                pool.destroy();
                return Err(e);
            }
        };

        Ok(Self {
            controller,
            signal,
            subdev: backends.subdev,
            pool,
            kernel_log: backends.kernel_log,
            monitor: Mutex::new(Some(MonitorHandle { cancel, thread })),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable(
                "video subsystem shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Start streaming (no-op when already streaming)
    pub fn start_streaming(&self) -> Result<()> {
        self.ensure_running()?;
        self.controller.start()
    }

    /// Stop streaming (no-op when not streaming)
    pub fn stop_streaming(&self) {
        self.controller.stop();
    }

    pub fn is_streaming(&self) -> bool {
        self.controller.is_streaming()
    }

    pub fn set_quality_factor(&self, quality_factor: f64) -> Result<()> {
        self.ensure_running()?;
        self.controller.set_quality_factor(quality_factor)?;
        Ok(())
    }

    pub fn quality_factor(&self) -> f64 {
        self.controller.quality_factor()
    }

    /// Last published input state
    pub fn status(&self) -> VideoState {
        self.signal.video_state()
    }

    /// Current EDID as lowercase hex
    pub fn get_edid_hex(&self) -> Result<String> {
        let mut buf = [0u8; edid::MAX_EDID_SIZE];
        let len = self.subdev.get_edid(&mut buf)?;
        Ok(edid::to_hex(&buf[..len.min(buf.len())]))
    }

    /// Parse, checksum and write an EDID; empty selects the default EDID
    pub fn set_edid_hex(&self, hex: &str) -> Result<()> {
        apply_edid(self.subdev.as_ref(), hex)
    }

    /// Ask the receiver to log its status and return that part of the kernel log
    pub fn log_status(&self) -> Result<String> {
        self.subdev.log_status()?;
        let log = (self.kernel_log)()?;
        Ok(extract_status_log(&log))
    }

    /// Stop streaming, stop the monitor and free the pool; idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Video subsystem already shut down");
            return;
        }
        info!("Shutting down video subsystem");

        self.controller.close();

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.cancel.cancel();
            if let Err(e) = self.subdev.unsubscribe_events() {
                warn!("Failed to unsubscribe HDMI events: {}", e);
            }
            if monitor.thread.join().is_err() {
                error!("HDMI monitor thread panicked");
            }
        }

        self.pool.destroy();
        info!("Video subsystem shut down");
    }
}

impl Drop for VideoService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_edid(subdev: &dyn HdmiSubdevice, hex: &str) -> Result<()> {
    let edid = edid::prepare(hex)?;
    subdev.set_edid(&edid)?;
    info!("HDMI EDID set ({} bytes)", edid.len());
    Ok(())
}

/// Keep the kernel log from the line holding the last `START STATUS` marker,
/// blanking `<6>` level prefixes
pub fn extract_status_log(log: &str) -> String {
    let Some(marker) = log.rfind("START STATUS") else {
        return log.to_string();
    };
    let start = log[..=marker].rfind('<').unwrap_or(0);
    log[start..].replace("<6>", "   ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::SignalState;
    use crate::video::hal::fake::{
        timings_1080p60, FakeEngine, FakeOpener, FakeSubdev, HeapAllocator, RecordingSink,
    };
    use nix::errno::Errno;
    use std::time::Instant;

    const KLOG: &str = "<6>[ 1.0] boot\n<6>[ 2.0] tc358743: =====  START STATUS  =====\n<6>[ 2.1] old\n<6>[ 9.0] tc358743: =====  START STATUS  =====\n<6>[ 9.1] Cable detected (+5V power): yes\n<6>[ 9.2] =====  END STATUS  =====\n";

    struct Harness {
        service: VideoService,
        subdev: Arc<FakeSubdev>,
        opener: FakeOpener,
    }

    fn harness(config: VideoConfig) -> Harness {
        let subdev = Arc::new(FakeSubdev::new());
        subdev.script(vec![Ok(timings_1080p60())]);
        let opener = FakeOpener::new(Duration::from_millis(2));
        let backends = VideoBackends {
            opener: Arc::new(opener.clone()),
            engine: Arc::new(FakeEngine::new()),
            subdev: subdev.clone(),
            allocator: Arc::new(HeapAllocator),
            kernel_log: Arc::new(|| Ok(KLOG.to_string())),
        };
        let service =
            VideoService::init(backends, Arc::new(RecordingSink::new()), &config, None).unwrap();
        Harness {
            service,
            subdev,
            opener,
        }
    }

    fn test_config() -> VideoConfig {
        VideoConfig {
            stop_settle_ms: 10,
            ..Default::default()
        }
    }

    fn wait_ready(service: &VideoService) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if service.status().ready {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_status_and_streaming() {
        let h = harness(test_config());
        assert!(h.subdev.is_subscribed());
        assert!(wait_ready(&h.service));

        let status = h.service.status();
        assert_eq!((status.width, status.height), (1920, 1080));
        assert_eq!(status.error, None);

        h.service.start_streaming().unwrap();
        h.service.start_streaming().unwrap();
        assert!(h.opener.wait_for("streamon", 1, Duration::from_secs(2)));
        assert!(h.service.is_streaming());

        h.service.stop_streaming();
        h.service.stop_streaming();
        assert!(!h.service.is_streaming());
        assert_eq!(h.opener.count("open"), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let h = harness(test_config());
        h.service.start_streaming().unwrap();

        h.service.shutdown();
        assert!(!h.service.is_streaming());
        assert!(!h.subdev.is_subscribed());
        assert!(h.service.pool.is_destroyed());

        h.service.shutdown();
        assert!(matches!(
            h.service.start_streaming(),
            Err(AppError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_quality_factor() {
        let h = harness(test_config());
        assert_eq!(h.service.quality_factor(), 1.0);
        h.service.set_quality_factor(0.3).unwrap();
        assert_eq!(h.service.quality_factor(), 0.3);
        assert!(matches!(
            h.service.set_quality_factor(-1.0),
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(h.service.quality_factor(), 0.3);
    }

    #[test]
    fn test_edid_roundtrip() {
        let h = harness(test_config());

        let mut hex = "ab".repeat(128);
        h.service.set_edid_hex(&hex).unwrap();
        let written = h.subdev.edid();
        assert_eq!(written.len(), 128);
        assert!(edid::checksum_ok(&written));

        // Checksum byte was rewritten
        hex.replace_range(254..256, &format!("{:02x}", written[127]));
        assert_eq!(h.service.get_edid_hex().unwrap(), hex);
    }

    #[test]
    fn test_edid_bad_input_leaves_device_alone() {
        let h = harness(test_config());
        let before = h.subdev.edid();

        assert!(matches!(
            h.service.set_edid_hex(&"00".repeat(100)),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            h.service.set_edid_hex("xyz"),
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(h.subdev.edid(), before);
    }

    #[test]
    fn test_configured_edid_restored() {
        let config = VideoConfig {
            edid: Some(String::new()),
            ..test_config()
        };
        let h = harness(config);
        assert_eq!(edid::to_hex(&h.subdev.edid()), edid::DEFAULT_EDID_HEX);
    }

    #[test]
    fn test_log_status() {
        let h = harness(test_config());
        let log = h.service.log_status().unwrap();
        assert_eq!(h.subdev.log_status_calls(), 1);
        assert!(log.starts_with("   [ 9.0] tc358743: =====  START STATUS"));
        assert!(!log.contains("old"));
        assert!(!log.contains("<6>"));
        assert!(log.contains("Cable detected"));
    }

    #[test]
    fn test_extract_status_log_without_marker() {
        assert_eq!(extract_status_log("<6>plain\n"), "<6>plain\n");
    }

    #[test]
    fn test_signal_loss_reported() {
        let h = harness(test_config());
        assert!(wait_ready(&h.service));

        h.subdev.script(vec![Err(Errno::ENOLINK)]);
        h.subdev.push_source_change();

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.service.status().ready && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let status = h.service.status();
        assert!(!status.ready);
        assert_eq!(status.error.as_deref(), Some("no_signal"));
        assert_eq!(h.service.signal.current(), SignalState::NoSignal);
    }

    #[test]
    fn test_unplug_closes_device_and_replug_reopens() {
        let h = harness(test_config());
        assert!(wait_ready(&h.service));
        h.service.start_streaming().unwrap();
        assert!(h.opener.wait_for("streamon", 1, Duration::from_secs(2)));

        h.subdev.script(vec![Err(Errno::ENOLINK)]);
        h.subdev.push_source_change();
        assert!(h.opener.wait_for("close", 1, Duration::from_secs(3)));
        assert_eq!(h.opener.count("streamoff"), 1);
        // The session survives and waits for the signal to come back
        assert!(h.service.is_streaming());

        h.subdev.script(vec![Ok(timings_1080p60())]);
        h.subdev.push_source_change();
        assert!(h.opener.wait_for("streamon", 2, Duration::from_secs(3)));
        assert_eq!(h.opener.log.lock().max_open_devices, 1);

        h.service.shutdown();
        assert!(matches!(
            h.service.start_streaming(),
            Err(AppError::ServiceUnavailable(_))
        ));
    }
}
