//! V4L2 capture device using v4l2r (ioctl layer), DMABUF memory.

use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, MemoryConsistency, QBufPlane, QBuffer,
    QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{DmaBufHandle, DmaBufSource, MemoryType};
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use super::hal::{
    CaptureDevice, CaptureDeviceOpener, DequeuedBuffer, DmaBuffer, QueriedBuffer,
};
use crate::error::{AppError, Result};
use crate::video::format::PixelFormat;

/// Borrowed view of a pool block's dmabuf for `VIDIOC_QBUF`
///
/// The slot keeps the block alive while the driver holds it.
struct SlotDmaBuf {
    fd: RawFd,
    len: u64,
}

impl fmt::Debug for SlotDmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotDmaBuf(fd={}, len={})", self.fd, self.len)
    }
}

impl AsRawFd for SlotDmaBuf {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsFd for SlotDmaBuf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl DmaBufSource for SlotDmaBuf {
    fn len(&self) -> u64 {
        self.len
    }
}

/// Opens the capture node for each streaming session
pub struct V4l2rCaptureOpener {
    path: PathBuf,
}

impl V4l2rCaptureOpener {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CaptureDeviceOpener for V4l2rCaptureOpener {
    fn open(&self) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(V4l2rCaptureDevice::open(&self.path)?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// V4L2 capture device with DMABUF-backed buffers
pub struct V4l2rCaptureDevice {
    fd: File,
    queue: QueueType,
}

impl V4l2rCaptureDevice {
    pub fn open(device_path: impl AsRef<Path>) -> Result<Self> {
        let path = device_path.as_ref();
        let fd = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.raw_os_error() {
                Some(errno) => AppError::device("open", nix::errno::Errno::from_raw(errno)),
                None => AppError::Io(e),
            })?;

        let caps: V4l2rCapability = ioctl::querycap(&fd)
            .map_err(|e| AppError::VideoError(format!("Failed to query capabilities: {}", e)))?;
        let caps_flags = caps.device_caps();

        // The HDMI bridge exposes a multi-planar queue; single-planar is a fallback
        let queue = if caps_flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE) {
            QueueType::VideoCaptureMplane
        } else if caps_flags.contains(Capabilities::VIDEO_CAPTURE) {
            warn!("{} has no multi-planar capture queue", path.display());
            QueueType::VideoCapture
        } else {
            return Err(AppError::VideoError(
                "Device does not support capture queues".to_string(),
            ));
        };

        debug!("Opened capture device {} ({:?})", path.display(), queue);
        Ok(Self { fd, queue })
    }
}

impl CaptureDevice for V4l2rCaptureDevice {
    fn set_format(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        let mut fmt: V4l2rFormat = ioctl::g_fmt(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("Failed to get device format: {}", e))
        })?;

        fmt.width = width;
        fmt.height = height;
        fmt.pixelformat = V4l2rPixelFormat::from(&format.fourcc());

        let actual: V4l2rFormat = ioctl::s_fmt(&mut self.fd, (self.queue, &fmt)).map_err(|e| {
            AppError::VideoError(format!("Failed to set device format: {}", e))
        })?;

        if actual.width != width || actual.height != height {
            return Err(AppError::VideoError(format!(
                "driver adjusted {}x{} to {}x{}",
                width, height, actual.width, actual.height
            )));
        }

        info!(
            "Capture format: {}x{} {} ({} planes)",
            actual.width,
            actual.height,
            format,
            actual.plane_fmt.len()
        );
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::DmaBuf,
            count,
            MemoryConsistency::empty(),
        )
        .map_err(|e| AppError::VideoError(format!("Failed to request buffers: {}", e)))?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<QueriedBuffer> {
        let query: QueryBuffer = ioctl::querybuf(&self.fd, self.queue, index as usize)
            .map_err(|e| {
                AppError::VideoError(format!("Failed to query buffer {}: {}", index, e))
            })?;

        let plane = query.planes.first().ok_or_else(|| {
            AppError::VideoError(format!("Driver returned zero planes for buffer {}", index))
        })?;
        Ok(QueriedBuffer {
            index,
            length: plane.length,
        })
    }

    fn queue_buffer(&mut self, index: u32, buffer: &dyn DmaBuffer) -> Result<()> {
        let handle = DmaBufHandle::from(SlotDmaBuf {
            fd: buffer.raw_fd(),
            len: buffer.len() as u64,
        });
        let mut qbuf: QBuffer<DmaBufHandle<SlotDmaBuf>> = QBuffer::new(self.queue, index);
        qbuf.planes = vec![QBufPlane::new_from_handle(&handle, 0)];
        ioctl::qbuf::<_, ()>(&self.fd, qbuf).map_err(|e| {
            AppError::VideoError(format!("Failed to queue buffer {}: {}", index, e))
        })?;
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        ioctl::streamon(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("Failed to start capture stream: {}", e))
        })
    }

    fn stream_off(&mut self) -> Result<()> {
        ioctl::streamoff(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("Failed to stop capture stream: {}", e))
        })
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| AppError::device("poll", e))?;
        Ok(ready > 0)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let dqbuf: V4l2Buffer = ioctl::dqbuf(&self.fd, self.queue)
            .map_err(|e| AppError::VideoError(format!("dqbuf failed: {}", e)))?;

        let raw = dqbuf.as_v4l2_buffer();
        let bytes_used = dqbuf
            .planes_iter()
            .map(|plane| *plane.bytesused)
            .sum::<u32>();
        Ok(DequeuedBuffer {
            index: raw.index,
            bytes_used,
            sequence: raw.sequence,
        })
    }
}
