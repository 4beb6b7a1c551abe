//! HDMI signal monitor
//!
//! A dedicated thread queries the receiver's DV timings, maps the outcome to a
//! [`SignalState`] and publishes it. Then it blocks until the receiver reports
//! a source change and queries again. Waits are bounded only so that shutdown
//! is noticed; a timeout never triggers a re-query.
//!
//! Whenever a format is locked while a session is streaming, the session is
//! restarted so capture and encode pick up the new geometry.

use nix::errno::Errno;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capture::sleep_cancellable;
use super::format::{SignalState, VideoState};
use super::hal::{HdmiSubdevice, SubdevEvent};
use super::streamer::StreamController;
use crate::error::Result;
use crate::events::{EventBus, SystemEvent};

/// Checkpoint interval of the event wait
const EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause before re-querying after an unexpected query error
const QUERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Current signal state, shared by the monitor and the pipeline workers
pub struct SignalShared {
    state: RwLock<SignalState>,
    events: Option<Arc<EventBus>>,
}

impl SignalShared {
    pub fn new(events: Option<Arc<EventBus>>) -> Self {
        Self {
            state: RwLock::new(SignalState::NoSignal),
            events,
        }
    }

    pub fn current(&self) -> SignalState {
        *self.state.read()
    }

    pub fn video_state(&self) -> VideoState {
        self.current().into()
    }

    /// Replace the current state and notify subscribers
    pub fn publish(&self, state: SignalState) {
        *self.state.write() = state;
        if let Some(events) = &self.events {
            events.publish(SystemEvent::VideoStateChanged(state.into()));
        }
    }
}

/// Query the receiver once and classify the result
///
/// `ENOLINK`, `ENOLCK` and `ERANGE` are signal states, not errors; anything
/// else is returned as an error.
pub fn query_signal(subdev: &dyn HdmiSubdevice) -> Result<SignalState> {
    match subdev.query_dv_timings() {
        Ok(timings) => Ok(SignalState::Locked(timings.to_format())),
        Err(e) => match e.errno() {
            Some(Errno::ENOLINK) => Ok(SignalState::NoSignal),
            Some(Errno::ENOLCK) => Ok(SignalState::Unstable),
            Some(Errno::ERANGE) => Ok(SignalState::OutOfRange),
            _ => Err(e),
        },
    }
}

/// Signal monitor thread
pub struct SignalMonitor {
    subdev: Arc<dyn HdmiSubdevice>,
    signal: Arc<SignalShared>,
    controller: Arc<StreamController>,
}

impl SignalMonitor {
    pub fn new(
        subdev: Arc<dyn HdmiSubdevice>,
        signal: Arc<SignalShared>,
        controller: Arc<StreamController>,
    ) -> Self {
        Self {
            subdev,
            signal,
            controller,
        }
    }

    /// Start the monitor thread; it runs until `cancel` fires or event
    /// delivery fails
    pub fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("hdmi-monitor".to_string())
            .spawn(move || self.run(cancel))?;
        Ok(handle)
    }

    fn run(self, cancel: CancellationToken) {
        info!("HDMI signal monitor started");

        while !cancel.is_cancelled() {
            self.detect(&cancel);

            match self.wait_source_change(&cancel) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    error!("Failed to dequeue HDMI event, monitor exiting: {}", e);
                    break;
                }
            }
        }

        info!("HDMI signal monitor stopped");
    }

    /// One detection cycle: query until a state can be published
    fn detect(&self, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match query_signal(self.subdev.as_ref()) {
                Ok(state) => {
                    self.publish(state);
                    return;
                }
                Err(e) => {
                    error!("Failed to query DV timings: {}", e);
                    sleep_cancellable(cancel, QUERY_RETRY_DELAY);
                }
            }
        }
    }

    fn publish(&self, state: SignalState) {
        match state {
            SignalState::Locked(format) => info!("HDMI signal locked: {}", format),
            SignalState::OutOfRange => warn!("HDMI timings out of range"),
            SignalState::NoSignal => info!("HDMI: no signal"),
            SignalState::Unstable => info!("HDMI: signal not locked"),
        }

        self.signal.publish(state);

        if state.is_locked() && self.controller.restart_if_active() {
            info!("Restarted streaming for new HDMI format");
        }
    }

    /// Wait for a source-change event; `Ok(false)` when cancelled
    fn wait_source_change(&self, cancel: &CancellationToken) -> Result<bool> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            match self.subdev.wait_event(EVENT_WAIT_TIMEOUT) {
                Ok(Some(SubdevEvent::SourceChange { changes })) => {
                    debug!("HDMI source change (changes={:#x})", changes);
                    return Ok(true);
                }
                Ok(Some(SubdevEvent::Other(kind))) => {
                    debug!("Ignoring subdevice event type {}", kind);
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
        }
    }
}
