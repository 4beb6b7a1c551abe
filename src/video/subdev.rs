//! HDMI receiver subdevice (`/dev/v4l-subdevN`)
//!
//! Thin ioctl layer: DV timings query, source-change events, EDID and the
//! driver status dump. Event waits poll for `POLLPRI` with a bounded timeout.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use v4l2r::bindings::{v4l2_dv_timings, v4l2_edid, v4l2_event, v4l2_event_subscription};

use super::format::DvTimings;
use super::hal::{HdmiSubdevice, SubdevEvent};
use crate::error::{AppError, Result};

nix::ioctl_read!(vidioc_query_dv_timings, b'V', 99, v4l2_dv_timings);
nix::ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, v4l2_event_subscription);
nix::ioctl_write_ptr!(vidioc_unsubscribe_event, b'V', 91, v4l2_event_subscription);
nix::ioctl_read!(vidioc_dqevent, b'V', 89, v4l2_event);
nix::ioctl_readwrite!(vidioc_g_edid, b'V', 40, v4l2_edid);
nix::ioctl_readwrite!(vidioc_s_edid, b'V', 41, v4l2_edid);
nix::ioctl_none!(vidioc_log_status, b'V', 70);

const V4L2_EVENT_ALL: u32 = 0;
const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;

/// `SYSLOG_ACTION_READ_ALL`
const SYSLOG_ACTION_READ_ALL: libc::c_int = 3;
const KERNEL_LOG_BUFFER_SIZE: usize = 40960;

/// V4L2 HDMI receiver subdevice
pub struct V4l2Subdev {
    fd: File,
}

impl V4l2Subdev {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                AppError::VideoError(format!("Failed to open subdevice {}: {}", path.display(), e))
            })?;
        debug!("Opened HDMI subdevice {}", path.display());
        Ok(Self { fd })
    }

    fn edid_request(&self, blocks: u32, edid: *mut u8) -> v4l2_edid {
        let mut request: v4l2_edid = unsafe { std::mem::zeroed() };
        request.pad = 0;
        request.start_block = 0;
        request.blocks = blocks;
        request.edid = edid;
        request
    }
}

impl HdmiSubdevice for V4l2Subdev {
    fn query_dv_timings(&self) -> Result<DvTimings> {
        let mut timings: v4l2_dv_timings = unsafe { std::mem::zeroed() };
        unsafe { vidioc_query_dv_timings(self.fd.as_raw_fd(), &mut timings) }
            .map_err(|e| AppError::device("VIDIOC_QUERY_DV_TIMINGS", e))?;

        // Packed struct: copy fields out by value
        let bt = unsafe { timings.__bindgen_anon_1.bt };
        Ok(DvTimings {
            width: bt.width,
            height: bt.height,
            pixelclock: bt.pixelclock,
            hfrontporch: bt.hfrontporch,
            hsync: bt.hsync,
            hbackporch: bt.hbackporch,
            vfrontporch: bt.vfrontporch,
            vsync: bt.vsync,
            vbackporch: bt.vbackporch,
        })
    }

    fn subscribe_source_change(&self) -> Result<()> {
        let mut sub: v4l2_event_subscription = unsafe { std::mem::zeroed() };
        sub.type_ = V4L2_EVENT_SOURCE_CHANGE;
        unsafe { vidioc_subscribe_event(self.fd.as_raw_fd(), &sub) }
            .map_err(|e| AppError::device("VIDIOC_SUBSCRIBE_EVENT", e))?;
        Ok(())
    }

    fn unsubscribe_events(&self) -> Result<()> {
        let mut sub: v4l2_event_subscription = unsafe { std::mem::zeroed() };
        sub.type_ = V4L2_EVENT_ALL;
        unsafe { vidioc_unsubscribe_event(self.fd.as_raw_fd(), &sub) }
            .map_err(|e| AppError::device("VIDIOC_UNSUBSCRIBE_EVENT", e))?;
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Result<Option<SubdevEvent>> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLPRI)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| AppError::device("poll", e))?;
        if ready == 0 {
            return Ok(None);
        }

        let mut event: v4l2_event = unsafe { std::mem::zeroed() };
        unsafe { vidioc_dqevent(self.fd.as_raw_fd(), &mut event) }
            .map_err(|e| AppError::device("VIDIOC_DQEVENT", e))?;

        let kind = event.type_;
        if kind == V4L2_EVENT_SOURCE_CHANGE {
            let changes = unsafe { event.u.src_change.changes };
            Ok(Some(SubdevEvent::SourceChange { changes }))
        } else {
            Ok(Some(SubdevEvent::Other(kind)))
        }
    }

    fn get_edid(&self, buf: &mut [u8]) -> Result<usize> {
        let blocks = (buf.len() / 128).min(2) as u32;
        if blocks == 0 {
            return Err(AppError::BadRequest(
                "EDID buffer smaller than one block".to_string(),
            ));
        }
        let mut request = self.edid_request(blocks, buf.as_mut_ptr());
        unsafe { vidioc_g_edid(self.fd.as_raw_fd(), &mut request) }
            .map_err(|e| AppError::device("VIDIOC_G_EDID", e))?;
        Ok(request.blocks.min(blocks) as usize * 128)
    }

    fn set_edid(&self, edid: &[u8]) -> Result<()> {
        super::edid::validate_len(edid.len())?;
        // The ioctl takes a mutable pointer but only reads on S_EDID
        let mut copy = edid.to_vec();
        let mut request = self.edid_request((copy.len() / 128) as u32, copy.as_mut_ptr());
        unsafe { vidioc_s_edid(self.fd.as_raw_fd(), &mut request) }
            .map_err(|e| AppError::device("VIDIOC_S_EDID", e))?;
        Ok(())
    }

    fn log_status(&self) -> Result<()> {
        unsafe { vidioc_log_status(self.fd.as_raw_fd()) }
            .map_err(|e| AppError::device("VIDIOC_LOG_STATUS", e))?;
        Ok(())
    }
}

/// Read the whole kernel ring buffer
pub fn read_kernel_log() -> Result<String> {
    let mut buf = vec![0u8; KERNEL_LOG_BUFFER_SIZE];
    let len = unsafe {
        libc::klogctl(
            SYSLOG_ACTION_READ_ALL,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len() as libc::c_int,
        )
    };
    if len < 0 {
        return Err(AppError::device("klogctl", Errno::last()));
    }
    buf.truncate(len as usize);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
