//! Streaming lifecycle manager
//!
//! [`StreamController`] owns the single streaming session. Session creation,
//! teardown and the quality factor live behind one lock, so at most one
//! pipeline worker exists at any instant and a restart always tears the old
//! session down before the new one starts.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capture::{run_pipeline, PipelineContext};
use crate::error::{AppError, Result};
use crate::events::SystemEvent;

/// Default pause between cancelling a worker and joining it
pub const DEFAULT_STOP_SETTLE: Duration = Duration::from_millis(1000);

/// A running pipeline worker
struct StreamingSession {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    generation: u64,
    quality_factor: f64,
}

struct ControllerInner {
    session: Option<StreamingSession>,
    quality_factor: f64,
    generation: u64,
    /// Set by `close`; no session starts afterwards
    closed: bool,
}

/// Owner of the streaming session
pub struct StreamController {
    ctx: Arc<PipelineContext>,
    stop_settle: Duration,
    inner: Mutex<ControllerInner>,
}

impl StreamController {
    pub fn new(ctx: Arc<PipelineContext>, quality_factor: f64, stop_settle: Duration) -> Self {
        Self {
            ctx,
            stop_settle,
            inner: Mutex::new(ControllerInner {
                session: None,
                quality_factor: quality_factor.clamp(0.0, 1.0),
                generation: 0,
                closed: false,
            }),
        }
    }

    /// Start a session; a no-op when one is already running
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner)
    }

    /// Stop the session; a no-op without one
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    /// Stop the session and refuse any later start
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.stop_locked(&mut inner);
    }

    /// Stop and start under a single lock acquisition
    pub fn restart(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
        self.start_locked(&mut inner)
    }

    /// Restart only if a session is running; true when restarted
    pub fn restart_if_active(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return false;
        }
        self.stop_locked(&mut inner);
        match self.start_locked(&mut inner) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to restart streaming: {}", e);
                false
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Generation of the most recently started session (0 before the first)
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn quality_factor(&self) -> f64 {
        self.inner.lock().quality_factor
    }

    /// Quality the running session was started with
    pub fn session_quality(&self) -> Option<f64> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.quality_factor)
    }

    /// Store a new quality factor in [0, 1]; restarts a running session
    ///
    /// Returns whether a restart happened.
    pub fn set_quality_factor(&self, quality_factor: f64) -> Result<bool> {
        if !(0.0..=1.0).contains(&quality_factor) {
            return Err(AppError::BadRequest(format!(
                "quality factor {} outside [0, 1]",
                quality_factor
            )));
        }

        let mut inner = self.inner.lock();
        inner.quality_factor = quality_factor;
        info!("Quality factor set to {:.2}", quality_factor);

        let restarted = if inner.session.is_some() {
            self.stop_locked(&mut inner);
            self.start_locked(&mut inner)?;
            true
        } else {
            false
        };
        drop(inner);

        self.publish(SystemEvent::QualityChanged {
            quality_factor,
            restarted,
        });
        Ok(restarted)
    }

    fn start_locked(&self, inner: &mut ControllerInner) -> Result<()> {
        if inner.closed {
            return Err(AppError::ServiceUnavailable(
                "stream controller closed".to_string(),
            ));
        }
        if inner.session.is_some() {
            warn!("Streaming already active, ignoring start");
            return Ok(());
        }

        let generation = inner.generation + 1;
        let quality_factor = inner.quality_factor;
        let cancel = CancellationToken::new();

        let ctx = self.ctx.clone();
        let token = cancel.clone();
        let worker = std::thread::Builder::new()
            .name(format!("video-pipeline-{}", generation))
            .spawn(move || run_pipeline(ctx, quality_factor, token))
            .map_err(|e| {
                error!("Failed to spawn pipeline worker: {}", e);
                AppError::Io(e)
            })?;

        // Published only once the worker exists
        inner.generation = generation;
        inner.session = Some(StreamingSession {
            cancel,
            worker,
            generation,
            quality_factor,
        });
        info!("Streaming started (generation {})", generation);
        self.publish(SystemEvent::StreamStateChanged {
            state: "streaming".to_string(),
            generation,
        });
        Ok(())
    }

    fn stop_locked(&self, inner: &mut ControllerInner) {
        let Some(session) = inner.session.take() else {
            debug!("No streaming session to stop");
            return;
        };

        session.cancel.cancel();
        std::thread::sleep(self.stop_settle);
        if session.worker.join().is_err() {
            error!("Pipeline worker {} panicked", session.generation);
        }

        info!("Streaming stopped (generation {})", session.generation);
        self.publish(SystemEvent::StreamStateChanged {
            state: "stopped".to_string(),
            generation: session.generation,
        });
    }

    fn publish(&self, event: SystemEvent) {
        if let Some(events) = &self.ctx.events {
            events.publish(event);
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(session) = inner.session.take() {
            session.cancel.cancel();
            let _ = session.worker.join();
        }
    }
}
