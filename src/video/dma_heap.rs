//! DMA heap allocator (`/dev/dma_heap/*`)
//!
//! Blocks are exported as dmabuf fds for the capture driver and mapped once
//! for CPU access. CPU reads are bracketed with `DMA_BUF_IOCTL_SYNC` so the
//! caches agree with what the device wrote.

use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, warn};

use super::hal::{DmaAllocator, DmaBuffer};
use crate::error::{AppError, Result};

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

nix::ioctl_readwrite!(dma_heap_ioctl_alloc, b'H', 0x0, DmaHeapAllocationData);
nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, u64);

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Allocator over one DMA heap device
pub struct DmaHeapAllocator {
    heap: File,
    path: String,
}

impl DmaHeapAllocator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let heap = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                AppError::VideoError(format!("Failed to open DMA heap {}: {}", path.display(), e))
            })?;
        Ok(Self {
            heap,
            path: path.display().to_string(),
        })
    }
}

impl DmaAllocator for DmaHeapAllocator {
    fn allocate(&self, size: usize) -> Result<Box<dyn DmaBuffer>> {
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| AppError::BadRequest("zero-sized DMA allocation".to_string()))?;

        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        unsafe { dma_heap_ioctl_alloc(self.heap.as_raw_fd(), &mut data) }
            .map_err(|e| AppError::device("DMA_HEAP_IOCTL_ALLOC", e))?;
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };

        let map = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(|e| AppError::device("mmap", e))?;

        debug!("Allocated {} bytes from {}", size, self.path);
        Ok(Box::new(DmaHeapBuffer { fd, len: size, map }))
    }
}

/// One dmabuf, mapped for CPU reads
pub struct DmaHeapBuffer {
    fd: OwnedFd,
    len: usize,
    map: NonNull<c_void>,
}

// The mapping is only read, between sync brackets; the fd is owned.
unsafe impl Send for DmaHeapBuffer {}
unsafe impl Sync for DmaHeapBuffer {}

impl DmaHeapBuffer {
    fn sync(&self, flags: u64) -> std::result::Result<(), Errno> {
        unsafe { dma_buf_ioctl_sync(self.fd.as_raw_fd(), &flags) }.map(|_| ())
    }
}

impl DmaBuffer for DmaHeapBuffer {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, f: &mut dyn FnMut(&[u8])) -> Result<()> {
        self.sync(DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ)
            .map_err(|e| AppError::device("DMA_BUF_IOCTL_SYNC", e))?;

        let data = unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const u8, self.len) };
        f(data);

        self.sync(DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ)
            .map_err(|e| AppError::device("DMA_BUF_IOCTL_SYNC", e))
    }
}

impl Drop for DmaHeapBuffer {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.map, self.len) } {
            warn!("Failed to unmap DMA buffer: {}", e);
        }
    }
}
