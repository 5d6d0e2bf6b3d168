//! Higher-level allocation of buffers.
//!
//! Allocating straight from a [`Pool`] hands every request to the driver and makes the caller
//! responsible for freeing. The [`BufferAllocator`] trait describes allocators that manage this
//! for you, and [`StandardBufferAllocator`] is the provided implementation: it keeps one pool
//! per queue family and recycles returned buffers through a lock-free queue, so steady-state
//! allocation does not call into the driver at all. Buffers are returned automatically when the
//! [`StandardBufferAlloc`] is dropped.

use crate::{
    device::{Device, DeviceOwned},
    pool::{BufferAllocateInfo, BufferLevel, Pool, PoolAlloc, PoolCreateFlags, PoolCreateInfo},
    QuarryError, Validated,
};
use crossbeam_queue::SegQueue;
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{collections::hash_map::Entry, mem::ManuallyDrop, sync::Arc, vec::IntoIter};

/// Types that manage the allocation and recycling of buffers.
///
/// # Safety
///
/// A pool and the buffers allocated from it must be externally synchronized. The implementation
/// of `BufferAllocator` is expected to manage this, including for the buffer give-back that
/// happens when an allocation is dropped.
pub unsafe trait BufferAllocator: DeviceOwned {
    /// See [`allocate`](Self::allocate).
    type Iter: Iterator<Item = Self::Alloc>;

    /// Represents a buffer that has been allocated from this allocator.
    type Alloc: DeviceOwned;

    /// Allocates `buffer_count` buffers for the given queue family.
    ///
    /// Returns an iterator over exactly the requested amount of buffers.
    fn allocate(
        &self,
        queue_family_index: u32,
        level: BufferLevel,
        buffer_count: u32,
    ) -> Result<Self::Iter, Validated<QuarryError>>;
}

/// Standard implementation of a buffer allocator.
///
/// The allocator can be shared between threads; the pool of each queue family is serialized
/// behind a mutex, and returned buffers travel through a lock-free queue. When a
/// [`StandardBufferAlloc`] is dropped, its buffer goes back to the allocator for reuse rather
/// than to the driver.
#[derive(Debug)]
pub struct StandardBufferAllocator {
    device: Arc<Device>,
    // Each queue family index maps to its own pool.
    pools: Mutex<HashMap<u32, Arc<RecyclingPool>>>,
}

impl StandardBufferAllocator {
    /// Creates a new `StandardBufferAllocator`.
    #[inline]
    pub fn new(device: Arc<Device>) -> Self {
        StandardBufferAllocator {
            device,
            pools: Mutex::new(HashMap::default()),
        }
    }
}

unsafe impl BufferAllocator for StandardBufferAllocator {
    type Iter = IntoIter<StandardBufferAlloc>;

    type Alloc = StandardBufferAlloc;

    /// # Panics
    ///
    /// - Panics if the queue family index is out of range for the device.
    fn allocate(
        &self,
        queue_family_index: u32,
        level: BufferLevel,
        buffer_count: u32,
    ) -> Result<Self::Iter, Validated<QuarryError>> {
        assert!(
            (queue_family_index as usize)
                < self.device.physical_device().queue_family_properties().len(),
        );

        let pool = {
            let mut pools = self.pools.lock();

            match pools.entry(queue_family_index) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let pool =
                        Arc::new(RecyclingPool::new(self.device.clone(), queue_family_index)?);
                    entry.insert(pool.clone());
                    pool
                }
            }
        };

        pool.allocate(level, buffer_count)
    }
}

unsafe impl DeviceOwned for StandardBufferAllocator {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[derive(Debug)]
struct RecyclingPool {
    // The driver pool specific to one queue family.
    inner: Mutex<Pool>,
    // Buffers that were returned and are available for reuse.
    free_primary: SegQueue<PoolAlloc>,
    free_secondary: SegQueue<PoolAlloc>,
}

impl RecyclingPool {
    fn new(device: Arc<Device>, queue_family_index: u32) -> Result<Self, Validated<QuarryError>> {
        let inner = Pool::new(
            device,
            PoolCreateInfo {
                // Individual recycling is the whole point of this pool.
                flags: PoolCreateFlags::RESET_BUFFER,
                queue_family_index,
                ..Default::default()
            },
        )?;

        Ok(RecyclingPool {
            inner: Mutex::new(inner),
            free_primary: SegQueue::new(),
            free_secondary: SegQueue::new(),
        })
    }

    fn free_queue(&self, level: BufferLevel) -> &SegQueue<PoolAlloc> {
        match level {
            BufferLevel::Primary => &self.free_primary,
            BufferLevel::Secondary => &self.free_secondary,
        }
    }

    fn allocate(
        self: &Arc<Self>,
        level: BufferLevel,
        buffer_count: u32,
    ) -> Result<IntoIter<StandardBufferAlloc>, Validated<QuarryError>> {
        let mut output = Vec::with_capacity(buffer_count as usize);

        // First, pick from the returned buffers.
        let free = self.free_queue(level);
        while output.len() < buffer_count as usize {
            match free.pop() {
                Some(alloc) => output.push(StandardBufferAlloc {
                    inner: ManuallyDrop::new(alloc),
                    pool: self.clone(),
                }),
                None => break,
            }
        }

        // Then allocate the rest from the driver pool.
        if output.len() < buffer_count as usize {
            let missing = buffer_count - output.len() as u32;

            for alloc in self.inner.lock().allocate_buffers(BufferAllocateInfo {
                level,
                buffer_count: missing,
                ..Default::default()
            })? {
                output.push(StandardBufferAlloc {
                    inner: ManuallyDrop::new(alloc),
                    pool: self.clone(),
                });
            }
        }

        Ok(output.into_iter())
    }
}

/// A buffer allocated from a [`StandardBufferAllocator`].
///
/// Dropping this returns the buffer to the allocator for reuse.
#[derive(Debug)]
pub struct StandardBufferAlloc {
    // The actual buffer. Extracted in the `Drop` implementation.
    inner: ManuallyDrop<PoolAlloc>,
    // We hold a reference to the recycling pool for our destructor.
    pool: Arc<RecyclingPool>,
}

impl StandardBufferAlloc {
    /// Returns the buffer held by this allocation.
    #[inline]
    pub fn inner(&self) -> &PoolAlloc {
        &self.inner
    }
}

unsafe impl DeviceOwned for StandardBufferAlloc {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.inner.device()
    }
}

impl Drop for StandardBufferAlloc {
    #[inline]
    fn drop(&mut self) {
        let alloc = unsafe { ManuallyDrop::take(&mut self.inner) };
        self.pool.free_queue(alloc.level()).push(alloc);
    }
}
