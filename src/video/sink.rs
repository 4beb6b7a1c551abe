//! Frame delivery sinks
//!
//! The encoder read-back loop hands every packet to a [`FrameSink`]. The
//! payload is borrowed from the encoder and only valid for the duration of
//! the call: sinks copy what they need before returning. There is exactly
//! one writer (the read-back thread of the active channel).
//!
//! ```text
//! H264Channel read-back thread
//!        |
//!        v  on_encoded_frame(&EncodedPacket)   (borrow)
//!   FrameSink ──> BroadcastSink ──> broadcast::Sender<EncodedVideoFrame>
//!            └──> WriterSink    ──> impl Write (file, stdout)
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::error;

/// Encoded packet as delivered to sinks
#[derive(Debug, Clone, Copy)]
pub struct EncodedPacket<'a> {
    /// Packet sequence number (per encode channel)
    pub sequence: u64,
    /// Annex-B H.264 payload, borrowed from the encoder
    pub payload: &'a [u8],
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    pub key_frame: bool,
}

/// Consumer of encoded packets
pub trait FrameSink: Send + Sync {
    /// Called once per packet; must not retain `packet.payload`
    fn on_encoded_frame(&self, packet: &EncodedPacket<'_>);
}

/// Owned copy of an encoded packet for distribution
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    /// Annex-B H.264 data
    pub data: Bytes,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub key_frame: bool,
    /// Time elapsed since the previous delivered frame
    pub interval: Duration,
}

/// Broadcast channel capacity (frames)
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// Copies packets into [`Bytes`] and broadcasts them
pub struct BroadcastSink {
    tx: broadcast::Sender<EncodedVideoFrame>,
    last_frame: Mutex<Option<Instant>>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            tx,
            last_frame: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EncodedVideoFrame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for BroadcastSink {
    fn on_encoded_frame(&self, packet: &EncodedPacket<'_>) {
        let now = Instant::now();
        let interval = {
            let mut last = self.last_frame.lock();
            let interval = last.map(|t| now.duration_since(t)).unwrap_or_default();
            *last = Some(now);
            interval
        };

        // No subscribers is normal, the frame is dropped
        let _ = self.tx.send(EncodedVideoFrame {
            data: Bytes::copy_from_slice(packet.payload),
            sequence: packet.sequence,
            timestamp_us: packet.timestamp_us,
            key_frame: packet.key_frame,
            interval,
        });
    }
}

/// Appends the raw Annex-B stream to a writer
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> FrameSink for WriterSink<W> {
    fn on_encoded_frame(&self, packet: &EncodedPacket<'_>) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(packet.payload).and_then(|_| writer.flush()) {
            error!("Failed to write packet {}: {}", packet.sequence, e);
        }
    }
}
