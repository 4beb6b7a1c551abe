use serde::{Deserialize, Serialize};

use crate::video::format::VideoState;

/// System event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "video.state_changed",
///   "data": { "ready": true, "width": 1920, "height": 1080, "fps": 60.0 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // HDMI Input Events
    // ============================================================================
    /// The signal monitor published a detection result
    ///
    /// Sent once per detection cycle, even when the state did not change.
    #[serde(rename = "video.state_changed")]
    VideoStateChanged(VideoState),

    // ============================================================================
    // Stream Events
    // ============================================================================
    /// Streaming session started or stopped
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged {
        /// Current state: "streaming", "stopped"
        state: String,
        /// Session generation (increments on every start)
        generation: u64,
    },

    /// A capture attempt failed and will be retried
    #[serde(rename = "stream.error")]
    StreamError {
        /// Stage that failed: "open", "setup", "capture"
        stage: String,
        /// Error message
        message: String,
    },

    /// Quality factor changed
    #[serde(rename = "stream.quality_changed")]
    QualityChanged {
        quality_factor: f64,
        /// Whether a running session was restarted to apply it
        restarted: bool,
    },
}

impl SystemEvent {
    /// Name carried in the serialized `event` tag
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::VideoStateChanged(_) => "video.state_changed",
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::StreamError { .. } => "stream.error",
            Self::QualityChanged { .. } => "stream.quality_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::SignalState;

    #[test]
    fn test_event_name() {
        let event = SystemEvent::StreamStateChanged {
            state: "streaming".to_string(),
            generation: 1,
        };
        assert_eq!(event.event_name(), "stream.state_changed");

        let event = SystemEvent::VideoStateChanged(SignalState::NoSignal.into());
        assert_eq!(event.event_name(), "video.state_changed");
    }

    #[test]
    fn test_serialization() {
        let event = SystemEvent::VideoStateChanged(SignalState::Unstable.into());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("video.state_changed"));
        assert!(json.contains("no_lock"));

        let deserialized: SystemEvent = serde_json::from_str(&json).unwrap();
        match deserialized {
            SystemEvent::VideoStateChanged(state) => {
                assert!(!state.ready);
                assert_eq!(state.error.as_deref(), Some("no_lock"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
