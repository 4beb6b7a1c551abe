//! Capture buffer memory
//!
//! Two layers:
//! - [`MemoryPool`]: DMA blocks preallocated once at subsystem init and
//!   shared by every streaming session until shutdown.
//! - [`SlotArena`]: the fixed set of capture slots of one session. Each slot
//!   owns one pool block and carries an explicit owner tag; a slot is either
//!   free, queued to the driver, or in flight to the encoder, never two at once.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::hal::{DmaAllocator, DmaBuffer};
use crate::error::{AppError, Result};

/// Number of capture slots per session
pub const CAPTURE_BUFFER_COUNT: usize = 3;

struct PoolInner {
    block_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<dyn DmaBuffer>>>,
    destroyed: AtomicBool,
}

/// Fixed pool of preallocated DMA blocks
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Preallocate `count` blocks of `block_size` bytes
    pub fn new(allocator: &dyn DmaAllocator, block_size: usize, count: usize) -> Result<Self> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(allocator.allocate(block_size)?);
        }
        info!("Created memory pool: {} blocks x {} bytes", count, block_size);

        Ok(Self {
            inner: Arc::new(PoolInner {
                block_size,
                capacity: count,
                free: Mutex::new(blocks),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of blocks not currently handed out
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Take a block able to hold `len` bytes
    pub fn acquire(&self, len: usize) -> Result<PoolBlock> {
        if self.is_destroyed() {
            return Err(AppError::VideoError("memory pool destroyed".to_string()));
        }
        if len > self.inner.block_size {
            return Err(AppError::VideoError(format!(
                "requested block of {} bytes exceeds pool block size {}",
                len, self.inner.block_size
            )));
        }

        let buffer = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or_else(|| AppError::VideoError("memory pool exhausted".to_string()))?;

        Ok(PoolBlock {
            buffer: Some(buffer),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Free every block; blocks still handed out are freed when released
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let freed = std::mem::take(&mut *self.inner.free.lock());
        info!("Destroyed memory pool ({} blocks freed)", freed.len());
    }
}

/// A block borrowed from the pool, returned on drop
pub struct PoolBlock {
    buffer: Option<Box<dyn DmaBuffer>>,
    pool: Weak<PoolInner>,
}

impl PoolBlock {
    pub fn buffer(&self) -> &dyn DmaBuffer {
        // Only None while dropping
        self.buffer.as_deref().expect("pool block already released")
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) if !pool.destroyed.load(Ordering::SeqCst) => {
                pool.free.lock().push(buffer);
            }
            _ => debug!("Freeing block released after pool teardown"),
        }
    }
}

/// Who currently holds a capture slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    /// Owned by the pipeline, not queued
    Free,
    /// Queued to the capture driver
    Driver,
    /// Dequeued and being submitted to the encoder
    InFlight,
}

struct Slot {
    block: PoolBlock,
    owner: SlotOwner,
}

/// Capture slots of one streaming session, indexed 0..N-1
#[derive(Default)]
pub struct SlotArena {
    slots: Vec<Slot>,
}

impl SlotArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(CAPTURE_BUFFER_COUNT),
        }
    }

    /// Bind a block to the next slot index
    pub fn push(&mut self, block: PoolBlock) -> u32 {
        self.slots.push(Slot {
            block,
            owner: SlotOwner::Free,
        });
        (self.slots.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owner(&self, index: u32) -> Option<SlotOwner> {
        self.slots.get(index as usize).map(|s| s.owner)
    }

    pub fn buffer(&self, index: u32) -> Option<&dyn DmaBuffer> {
        self.slots.get(index as usize).map(|s| s.block.buffer())
    }

    /// Count of slots with the given owner
    pub fn count(&self, owner: SlotOwner) -> usize {
        self.slots.iter().filter(|s| s.owner == owner).count()
    }

    /// Free | InFlight -> Driver
    pub fn mark_queued(&mut self, index: u32) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.owner == SlotOwner::Driver {
            return Err(AppError::Contract(format!(
                "slot {} queued twice",
                index
            )));
        }
        slot.owner = SlotOwner::Driver;
        Ok(())
    }

    /// Driver -> InFlight, returning the slot's block
    pub fn take_from_driver(&mut self, index: u32) -> Result<&dyn DmaBuffer> {
        let slot = self.slot_mut(index)?;
        if slot.owner != SlotOwner::Driver {
            return Err(AppError::Contract(format!(
                "driver returned slot {} which is {:?}",
                index, slot.owner
            )));
        }
        slot.owner = SlotOwner::InFlight;
        Ok(slot.block.buffer())
    }

    /// InFlight -> Free (re-queue failed, slot leaves the ring)
    pub fn release(&mut self, index: u32) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.owner != SlotOwner::InFlight {
            return Err(AppError::Contract(format!(
                "slot {} released while {:?}",
                index, slot.owner
            )));
        }
        slot.owner = SlotOwner::Free;
        Ok(())
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot> {
        let len = self.slots.len();
        self.slots.get_mut(index as usize).ok_or_else(|| {
            AppError::Contract(format!("slot index {} out of range (0..{})", index, len))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::hal::fake::HeapAllocator;

    fn pool(count: usize) -> MemoryPool {
        MemoryPool::new(&HeapAllocator, 64, count).unwrap()
    }

    #[test]
    fn test_pool_acquire_and_return() {
        let pool = pool(3);
        assert_eq!(pool.available(), 3);

        let a = pool.acquire(64).unwrap();
        let b = pool.acquire(10).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(a.buffer().len(), 64);

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_pool_rejects_oversized_and_exhaustion() {
        let pool = pool(1);
        assert!(pool.acquire(65).is_err());

        let _held = pool.acquire(1).unwrap();
        assert!(pool.acquire(1).is_err());
    }

    #[test]
    fn test_pool_destroy() {
        let pool = pool(2);
        let held = pool.acquire(1).unwrap();
        pool.destroy();
        assert!(pool.is_destroyed());
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire(1).is_err());

        // Released after teardown: freed, not returned
        drop(held);
        assert_eq!(pool.available(), 0);

        // Second destroy is a no-op
        pool.destroy();
    }

    #[test]
    fn test_slot_transitions() {
        let pool = pool(3);
        let mut arena = SlotArena::new();
        for _ in 0..3 {
            arena.push(pool.acquire(64).unwrap());
        }
        assert_eq!(arena.count(SlotOwner::Free), 3);

        for i in 0..3 {
            arena.mark_queued(i).unwrap();
        }
        assert_eq!(arena.count(SlotOwner::Driver), 3);

        arena.take_from_driver(1).unwrap();
        assert_eq!(arena.owner(1), Some(SlotOwner::InFlight));
        // Never queued and in flight at once
        assert_eq!(arena.count(SlotOwner::Driver), 2);

        arena.mark_queued(1).unwrap();
        assert_eq!(arena.owner(1), Some(SlotOwner::Driver));
    }

    #[test]
    fn test_slot_contract_violations() {
        let pool = pool(2);
        let mut arena = SlotArena::new();
        arena.push(pool.acquire(1).unwrap());

        // Not queued yet
        assert!(matches!(
            arena.take_from_driver(0),
            Err(AppError::Contract(_))
        ));
        // Unknown index
        assert!(matches!(arena.mark_queued(7), Err(AppError::Contract(_))));

        arena.mark_queued(0).unwrap();
        assert!(matches!(arena.mark_queued(0), Err(AppError::Contract(_))));
        assert!(matches!(arena.release(0), Err(AppError::Contract(_))));

        arena.take_from_driver(0).unwrap();
        arena.release(0).unwrap();
        assert_eq!(arena.owner(0), Some(SlotOwner::Free));
    }

    #[test]
    fn test_arena_drop_returns_blocks() {
        let pool = pool(3);
        {
            let mut arena = SlotArena::new();
            arena.push(pool.acquire(1).unwrap());
            arena.push(pool.acquire(1).unwrap());
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 3);
    }
}
