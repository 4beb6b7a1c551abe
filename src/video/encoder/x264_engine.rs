//! Software H.264 encode engine backed by x264
//!
//! Boards without a hardware encoder run the same channel protocol on the
//! CPU. Frames are converted YUYV -> I420 inside `send_frame`, so the capture
//! slot can go back to the driver right after the call returns. A dedicated
//! thread owns the x264 encoder:
//!
//! ```text
//! send_frame ──(3 frames)──> x264-encode thread ──(3 packets)──> get_stream
//! ```
//!
//! Rate control is plain ABR at `bitrate_kbps`: the x264 bindings expose no
//! VBV settings, so `max_bitrate_kbps` has no effect here.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::config::EncoderPreset;
use crate::error::{AppError, Result};
use crate::video::hal::{ChannelAttr, EncodeEngine, H264Profile, RawFrame, StreamPacket};

/// Depth of the frame and packet queues around the encode thread
const QUEUE_DEPTH: usize = 3;

/// Frame converted to I420, owned by the encode thread
struct I420Frame {
    data: Vec<u8>,
    sequence: u64,
    pts_us: u64,
}

struct EncodeThread {
    frames: Sender<I420Frame>,
    handle: JoinHandle<()>,
    width: u32,
    height: u32,
}

/// x264 implementation of [`EncodeEngine`]
pub struct X264Engine {
    preset: EncoderPreset,
    fps: u32,
    thread: Mutex<Option<EncodeThread>>,
    packets: Mutex<Option<Receiver<StreamPacket>>>,
    receiving: AtomicBool,
}

impl X264Engine {
    pub fn new(preset: EncoderPreset, fps: u32) -> Self {
        Self {
            preset,
            fps: fps.max(1),
            thread: Mutex::new(None),
            packets: Mutex::new(None),
            receiving: AtomicBool::new(false),
        }
    }

    fn engine_error(op: &'static str, errno: i32) -> AppError {
        AppError::Encoder { op, code: -errno }
    }
}

impl EncodeEngine for X264Engine {
    fn create_channel(&self, attr: &ChannelAttr) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(Self::engine_error("create_channel", libc::EBUSY));
        }
        // 4:2:0 needs even dimensions
        let width = attr.width & !1;
        let height = attr.height & !1;
        if width == 0 || height == 0 {
            return Err(AppError::BadRequest(format!(
                "invalid encode size {}x{}",
                attr.width, attr.height
            )));
        }

        let (frame_tx, frame_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (packet_tx, packet_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let settings = EncodeSettings {
            preset: self.preset,
            fps: self.fps,
            width,
            height,
            bitrate_kbps: attr.bitrate_kbps,
            gop: attr.gop,
            profile: attr.profile,
        };
        let handle = std::thread::Builder::new()
            .name("x264-encode".to_string())
            .spawn(move || encode_loop(settings, frame_rx, packet_tx, ready_tx))?;

        // Encoder construction happens on the thread that will own it
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AppError::Internal(
                    "x264 encode thread exited during setup".to_string(),
                ));
            }
        }

        info!(
            "x264 channel created: {}x{} {:?} bitrate={}kbps gop={}",
            width, height, self.preset, attr.bitrate_kbps, attr.gop
        );
        *self.packets.lock() = Some(packet_rx);
        *thread = Some(EncodeThread {
            frames: frame_tx,
            handle,
            width,
            height,
        });
        Ok(())
    }

    fn destroy_channel(&self) -> Result<()> {
        self.receiving.store(false, Ordering::SeqCst);
        let Some(thread) = self.thread.lock().take() else {
            return Err(Self::engine_error("destroy_channel", libc::ENOENT));
        };

        // Dropping both queue ends unblocks the encode thread either way
        self.packets.lock().take();
        drop(thread.frames);
        if thread.handle.join().is_err() {
            error!("x264 encode thread panicked");
        }
        debug!("x264 channel destroyed");
        Ok(())
    }

    fn start_recv_frame(&self) -> Result<()> {
        if self.thread.lock().is_none() {
            return Err(Self::engine_error("start_recv_frame", libc::ENOENT));
        }
        self.receiving.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_recv_frame(&self) -> Result<()> {
        self.receiving.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send_frame(&self, frame: &RawFrame<'_>, timeout: Duration) -> Result<()> {
        if !self.receiving.load(Ordering::SeqCst) {
            return Err(Self::engine_error("send_frame", libc::EPERM));
        }
        let (frames, width, height) = {
            let thread = self.thread.lock();
            let thread = thread
                .as_ref()
                .ok_or_else(|| Self::engine_error("send_frame", libc::ENOENT))?;
            (thread.frames.clone(), thread.width, thread.height)
        };

        let mut converted = Err(AppError::Internal("frame not read".to_string()));
        frame.buffer.read(&mut |data| {
            converted = yuyv_to_i420(data, frame.width, frame.height, width, height);
        })?;

        let pending = I420Frame {
            data: converted?,
            sequence: frame.sequence,
            pts_us: frame.pts_us,
        };

        match frames.send_timeout(pending, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(Self::engine_error("send_frame", libc::ETIMEDOUT))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(Self::engine_error("send_frame", libc::EPIPE))
            }
        }
    }

    fn get_stream(&self, timeout: Duration) -> Result<Option<StreamPacket>> {
        let packets = self.packets.lock();
        let Some(rx) = packets.as_ref() else {
            return Err(Self::engine_error("get_stream", libc::ENOENT));
        };
        match rx.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Self::engine_error("get_stream", libc::EPIPE))
            }
        }
    }

    fn release_stream(&self, packet: StreamPacket) -> Result<()> {
        trace!("Released packet {}", packet.sequence);
        Ok(())
    }
}

struct EncodeSettings {
    preset: EncoderPreset,
    fps: u32,
    width: u32,
    height: u32,
    bitrate_kbps: u32,
    gop: u32,
    profile: H264Profile,
}

fn x264_preset(preset: EncoderPreset) -> x264::Preset {
    match preset {
        EncoderPreset::Ultrafast => x264::Preset::Ultrafast,
        EncoderPreset::Superfast => x264::Preset::Superfast,
        EncoderPreset::Veryfast => x264::Preset::Veryfast,
        EncoderPreset::Faster => x264::Preset::Faster,
        EncoderPreset::Fast => x264::Preset::Fast,
        EncoderPreset::Medium => x264::Preset::Medium,
    }
}

fn build_encoder(settings: &EncodeSettings) -> Result<x264::Encoder> {
    let setup = x264::Setup::preset(x264_preset(settings.preset), x264::Tune::None, false, true)
        .fps(settings.fps, 1)
        .bitrate(settings.bitrate_kbps as i32)
        .max_keyframe_interval(settings.gop as i32)
        .scenecut_threshold(0);

    let setup = match settings.profile {
        H264Profile::Baseline => setup.baseline(),
        H264Profile::Main => setup.main(),
        H264Profile::High => setup.high(),
    };

    setup
        .build(
            x264::Colorspace::I420,
            settings.width as i32,
            settings.height as i32,
        )
        .map_err(|e| AppError::VideoError(format!("x264 setup failed: {:?}", e)))
}

fn encode_loop(
    settings: EncodeSettings,
    frames: Receiver<I420Frame>,
    packets: Sender<StreamPacket>,
    ready: Sender<Result<()>>,
) {
    let mut encoder = match build_encoder(&settings) {
        Ok(encoder) => {
            let _ = ready.send(Ok(()));
            encoder
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let width = settings.width as usize;
    let height = settings.height as usize;
    let luma = width * height;
    let chroma = luma / 4;
    let mut frame_index = 0i64;

    while let Ok(frame) = frames.recv() {
        let image = x264::Image::new(
            x264::Colorspace::I420,
            width as i32,
            height as i32,
            &[
                x264::Plane {
                    data: &frame.data[..luma],
                    stride: width as i32,
                },
                x264::Plane {
                    data: &frame.data[luma..luma + chroma],
                    stride: (width / 2) as i32,
                },
                x264::Plane {
                    data: &frame.data[luma + chroma..luma + 2 * chroma],
                    stride: (width / 2) as i32,
                },
            ],
        );

        let (data, picture) = match encoder.encode(frame_index, image) {
            Ok(out) => out,
            Err(e) => {
                error!("x264 encode failed for frame {}: {:?}", frame.sequence, e);
                continue;
            }
        };
        frame_index += 1;

        let bytes = data.entirety();
        if bytes.is_empty() {
            continue;
        }

        let packet = StreamPacket {
            sequence: frame.sequence,
            pts_us: frame.pts_us,
            data: bytes.to_vec(),
            key_frame: picture.keyframe(),
        };
        if packets.send(packet).is_err() {
            break;
        }
    }

    debug!("x264 encode thread exiting after {} frames", frame_index);
}

/// Convert packed YUYV to planar I420 at `out_width` x `out_height`
///
/// The output size must be even and not exceed the source; chroma is
/// averaged over each pair of source rows.
fn yuyv_to_i420(
    src: &[u8],
    src_width: u32,
    src_height: u32,
    out_width: u32,
    out_height: u32,
) -> Result<Vec<u8>> {
    let stride = src_width as usize * 2;
    let (w, h) = (out_width as usize, out_height as usize);
    if out_width > src_width || out_height > src_height || src.len() < stride * h {
        return Err(AppError::VideoError(format!(
            "YUYV frame of {} bytes too small for {}x{}",
            src.len(),
            out_width,
            out_height
        )));
    }

    let luma = w * h;
    let mut out = vec![0u8; luma + luma / 2];
    let (y_plane, chroma) = out.split_at_mut(luma);
    let (u_plane, v_plane) = chroma.split_at_mut(luma / 4);

    for row in 0..h {
        let line = &src[row * stride..row * stride + w * 2];
        for (x, y) in y_plane[row * w..(row + 1) * w].iter_mut().enumerate() {
            *y = line[x * 2];
        }
    }

    for cy in 0..h / 2 {
        let top = &src[(cy * 2) * stride..];
        let bottom = &src[(cy * 2 + 1) * stride..];
        for cx in 0..w / 2 {
            let i = cx * 4;
            let u = (top[i + 1] as u16 + bottom[i + 1] as u16 + 1) / 2;
            let v = (top[i + 3] as u16 + bottom[i + 3] as u16 + 1) / 2;
            u_plane[cy * (w / 2) + cx] = u as u8;
            v_plane[cy * (w / 2) + cx] = v as u8;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::channel_attr;
    use crate::video::format::PixelFormat;
    use crate::video::hal::fake::HeapBuffer;

    #[test]
    fn test_yuyv_to_i420() {
        // 2x2: Y0 U Y1 V per row
        let src = [10, 100, 20, 200, 30, 110, 40, 210];
        let out = yuyv_to_i420(&src, 2, 2, 2, 2).unwrap();
        assert_eq!(out, vec![10, 20, 30, 40, 105, 205]);
    }

    #[test]
    fn test_yuyv_to_i420_crops_odd_size() {
        let src = vec![0u8; 3 * 3 * 2];
        let out = yuyv_to_i420(&src, 3, 3, 2, 2).unwrap();
        assert_eq!(out.len(), 6);
        assert!(yuyv_to_i420(&src[..4], 3, 3, 2, 2).is_err());
    }

    #[test]
    fn test_encode_round() {
        let engine = X264Engine::new(EncoderPreset::Ultrafast, 30);
        engine.create_channel(&channel_attr(500, 1000, 64, 64)).unwrap();
        engine.start_recv_frame().unwrap();

        let buffer = HeapBuffer::filled(64 * 64 * 2, 128);
        let frame = RawFrame {
            buffer: &buffer,
            width: 64,
            height: 64,
            vir_width: 64,
            vir_height: 64,
            format: PixelFormat::Yuyv,
            sequence: 0,
            pts_us: 0,
        };
        engine.send_frame(&frame, Duration::from_secs(2)).unwrap();

        let packet = engine
            .get_stream(Duration::from_secs(5))
            .unwrap()
            .expect("first frame produces a packet");
        assert!(packet.key_frame);
        assert_eq!(packet.sequence, 0);
        assert!(packet.data.starts_with(&[0, 0, 0, 1]) || packet.data.starts_with(&[0, 0, 1]));
        engine.release_stream(packet).unwrap();

        engine.stop_recv_frame().unwrap();
        assert!(engine.send_frame(&frame, Duration::from_millis(10)).is_err());
        engine.destroy_channel().unwrap();
        assert!(engine.destroy_channel().is_err());
    }

    #[test]
    fn test_send_times_out_when_queues_are_full() {
        let engine = X264Engine::new(EncoderPreset::Ultrafast, 30);
        engine.create_channel(&channel_attr(500, 1000, 64, 64)).unwrap();
        engine.start_recv_frame().unwrap();

        let buffer = HeapBuffer::filled(64 * 64 * 2, 128);
        let mut timed_out = false;
        // Nobody drains packets, so the encode thread stalls and intake fills up
        for sequence in 0..32 {
            let frame = RawFrame {
                buffer: &buffer,
                width: 64,
                height: 64,
                vir_width: 64,
                vir_height: 64,
                format: PixelFormat::Yuyv,
                sequence,
                pts_us: 0,
            };
            match engine.send_frame(&frame, Duration::from_millis(50)) {
                Ok(()) => {}
                Err(AppError::Encoder { code, .. }) => {
                    assert_eq!(code, -libc::ETIMEDOUT);
                    timed_out = true;
                    break;
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert!(timed_out);

        // Dropping the packet queue unblocks the encode thread
        engine.destroy_channel().unwrap();
    }
}
